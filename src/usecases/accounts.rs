//! Account management: registration validation, profile editing and
//! user search.
//!
//! Credential handling itself (token issuance, password storage) lives
//! with the auth vendor; callers hand us the vendor-issued user id and
//! this module owns everything around the profile document.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::entities::User;
use crate::media::{MediaError, MediaUploader};
use crate::repositories::{ProfileMutation, RepositoryError, UserRepository};

lazy_static! {
    static ref USERNAME: Regex = Regex::new(r"^[a-z0-9._]{1,20}$").unwrap();
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("username must be 1-20 characters of a-z, 0-9, '.', '_'")]
    InvalidUsername,
    #[error("email address is malformed")]
    InvalidEmail,
    #[error("password needs 8+ characters with upper, lower, digit and symbol")]
    WeakPassword,
    #[error("username is already taken")]
    UsernameTaken,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Remote(#[from] RepositoryError),
}

/// What a new account needs from the caller. `id` comes from the auth
/// vendor, which issues it at credential creation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
}

/// Checked before the credential ever reaches the vendor; the vendor's
/// own policy is laxer than ours.
pub fn validate_password(password: &str) -> Result<(), AccountError> {
    let long_enough = password.chars().count() >= 8;
    let lower = password.chars().any(|c| c.is_ascii_lowercase());
    let upper = password.chars().any(|c| c.is_ascii_uppercase());
    let digit = password.chars().any(|c| c.is_ascii_digit());
    let symbol = password.chars().any(|c| !c.is_ascii_alphanumeric());
    if long_enough && lower && upper && digit && symbol {
        Ok(())
    } else {
        Err(AccountError::WeakPassword)
    }
}

pub struct Accounts {
    users: Arc<dyn UserRepository>,
    uploader: Arc<dyn MediaUploader>,
}

impl Accounts {
    pub fn new(users: Arc<dyn UserRepository>, uploader: Arc<dyn MediaUploader>) -> Self {
        Self { users, uploader }
    }

    /// Validates the registration, rejects taken usernames, and creates
    /// the profile document with zeroed counters.
    pub async fn register(&self, registration: Registration) -> Result<User, AccountError> {
        let Registration {
            id,
            username,
            full_name,
            email,
        } = registration;

        if !USERNAME.is_match(&username) {
            return Err(AccountError::InvalidUsername);
        }
        if !EMAIL.is_match(&email) {
            return Err(AccountError::InvalidEmail);
        }
        if self.users.find_by_username(&username).await?.is_some() {
            return Err(AccountError::UsernameTaken);
        }

        let user = User {
            id,
            username,
            full_name,
            email,
            profile_picture: None,
            bio: String::new(),
            followers_count: 0,
            following_count: 0,
            is_private: false,
        };

        // The username index is the real arbiter; the pre-check above only
        // improves the error before the write races.
        if !self.users.insert(user.clone()).await? {
            return Err(AccountError::UsernameTaken);
        }

        tracing::info!(username = %user.username, "registered account");
        Ok(user)
    }

    /// Applies a partial profile edit. When a new avatar is supplied its
    /// bytes are uploaded first and the hosted URL lands in the same
    /// mutation, so the profile never points at an image that failed to
    /// upload.
    pub async fn edit_profile(
        &self,
        id: Uuid,
        mut mutation: ProfileMutation,
        new_avatar: Option<Vec<u8>>,
    ) -> Result<User, AccountError> {
        if let Some(bytes) = new_avatar {
            let url = self.uploader.upload(bytes, "avatar.jpg").await?;
            mutation.profile_picture = Some(url);
        }
        Ok(self.users.update_profile(id, mutation).await?)
    }

    pub async fn search(&self, username_prefix: &str) -> Result<Vec<User>, AccountError> {
        Ok(self.users.search(username_prefix).await?)
    }
}
