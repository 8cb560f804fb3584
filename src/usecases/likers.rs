//! Likers list for a post: the like edges joined with the profiles behind
//! them, plus the viewer's follow state so the screen can offer the
//! follow button inline.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use uuid::Uuid;

use crate::repositories::{FollowRepository, LikeRepository, RepositoryError, UserRepository};

#[derive(Debug, Clone, PartialEq)]
pub struct LikerCard {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub profile_picture: Option<String>,
    pub followed_by_viewer: bool,
}

pub struct Likers {
    likes: Arc<dyn LikeRepository>,
    follows: Arc<dyn FollowRepository>,
    users: Arc<dyn UserRepository>,
}

impl Likers {
    pub fn new(
        likes: Arc<dyn LikeRepository>,
        follows: Arc<dyn FollowRepository>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            likes,
            follows,
            users,
        }
    }

    /// Resolves every liker of the post to a profile card, fanning the
    /// lookups out concurrently. A liker whose profile no longer resolves
    /// is dropped from the list rather than rendered as a hole.
    pub async fn of_post(
        &self,
        viewer_id: Uuid,
        post_id: Uuid,
    ) -> Result<Vec<LikerCard>, RepositoryError> {
        let liker_ids = self.likes.likers_of(post_id).await?;
        let followed: HashSet<Uuid> = self
            .follows
            .following_ids(viewer_id)
            .await?
            .into_iter()
            .collect();

        let profiles = try_join_all(liker_ids.into_iter().map(|id| {
            let users = self.users.clone();
            async move {
                match users.find(id).await {
                    Ok(u) => Ok(Some(u)),
                    Err(RepositoryError::NotFound) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }))
        .await?;

        Ok(profiles
            .into_iter()
            .flatten()
            .map(|u| LikerCard {
                followed_by_viewer: followed.contains(&u.id),
                id: u.id,
                username: u.username,
                full_name: u.full_name,
                profile_picture: u.profile_picture,
            })
            .collect())
    }
}
