use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::entities::{Comment, Message, Post, User};

pub mod mock;
pub mod mongo;

pub type Result<T> = ::std::result::Result<T, RepositoryError>;

/// Failure taxonomy of the remote store. Nothing here is fatal to the
/// process; every variant is recoverable at the level of the user action
/// that triggered it.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("transport failure: {0}")]
    Network(#[source] anyhow::Error),
    #[error("permission denied")]
    PermissionDenied,
    #[error("cannot find document")]
    NotFound,
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("malformed document: {0}")]
    Decode(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Returns `false` when a user with the same id already exists.
    async fn insert(&self, user: User) -> Result<bool>;

    async fn find(&self, id: Uuid) -> Result<User>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn search(&self, username_prefix: &str) -> Result<Vec<User>>;

    async fn update_profile(&self, id: Uuid, mutation: ProfileMutation) -> Result<User>;
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert(&self, post: Post) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Post>;
    async fn find_by_authors(&self, author_ids: &[Uuid]) -> Result<Vec<Post>>;

    /// Replaces the text content and bumps `updated_at`.
    async fn edit_content(&self, id: Uuid, content: String) -> Result<Post>;
}

#[async_trait]
pub trait CommentRepository: Send + Sync {
    /// Writes the comment and increments the post's `comments_count` in the
    /// same atomic batch.
    async fn insert(&self, comment: Comment) -> Result<()>;

    async fn find_by_post(&self, post_id: Uuid) -> Result<Vec<Comment>>;
}

#[async_trait]
pub trait LikeRepository: Send + Sync {
    async fn is_liked(&self, user_id: Uuid, post_id: Uuid) -> Result<bool>;
    async fn liked_post_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn likers_of(&self, post_id: Uuid) -> Result<Vec<Uuid>>;

    /// Creates or deletes the `(user_id, post_id)` edge record and applies
    /// the matching `likes_count` delta on the post document, all-or-nothing.
    /// A plain pair of writes is not an acceptable substitute: a dropped
    /// connection between them leaves the counter invariant violated.
    async fn set_liked(&self, user_id: Uuid, post_id: Uuid, liked: bool) -> Result<()>;
}

#[async_trait]
pub trait FollowRepository: Send + Sync {
    async fn is_following(&self, follower_id: Uuid, followed_id: Uuid) -> Result<bool>;
    async fn following_ids(&self, follower_id: Uuid) -> Result<Vec<Uuid>>;
    async fn follower_ids(&self, followed_id: Uuid) -> Result<Vec<Uuid>>;

    /// Creates or deletes the follow edge and adjusts `followers_count` on
    /// the followed user plus `following_count` on the follower, in one
    /// atomic batch.
    async fn set_following(&self, follower_id: Uuid, followed_id: Uuid, following: bool)
        -> Result<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persists a new message. `created_at` is assigned by the store, never
    /// by the caller; the returned record carries the assigned timestamp.
    async fn send(&self, sender_id: Uuid, receiver_id: Uuid, content: String) -> Result<Message>;

    /// Opens a live subscription over the whole message keyspace. The
    /// vendor side cannot filter by conversation pair, so every snapshot
    /// carries all messages and callers filter locally.
    async fn subscribe(&self) -> Result<MessageSubscription>;
}

/// Live handle over the realtime message keyspace. Each snapshot replaces
/// the previous one wholesale. Holds store-side listener resources until
/// closed; dropping the handle releases them too, so no subscribe path can
/// leak a listener.
pub struct MessageSubscription {
    rx: watch::Receiver<Vec<Message>>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl MessageSubscription {
    pub(crate) fn new(
        rx: watch::Receiver<Vec<Message>>,
        canceller: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            canceller: Some(Box::new(canceller)),
        }
    }

    /// Waits for the next snapshot. Returns `false` once the publishing
    /// side has gone away.
    pub async fn changed(&mut self) -> bool { self.rx.changed().await.is_ok() }

    pub fn snapshot(&self) -> Vec<Message> { self.rx.borrow().clone() }

    pub fn close(mut self) { self.release() }

    fn release(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            tracing::debug!("releasing message subscription");
            cancel();
        }
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) { self.release() }
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileMutation {
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture: Option<String>,
    pub is_private: Option<bool>,
}
