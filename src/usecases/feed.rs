//! Feed assembly: posts by the viewer and everyone they follow, joined
//! with author profiles and the viewer's like state into render-ready
//! items.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use uuid::Uuid;

use super::ANONYMOUS;
use crate::entities::Post;
use crate::repositories::{
    FollowRepository, LikeRepository, PostRepository, RepositoryError, UserRepository,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub post: Post,
    pub author_username: String,
    pub author_picture: Option<String>,
    pub liked_by_viewer: bool,
}

pub struct FeedAssembler {
    users: Arc<dyn UserRepository>,
    posts: Arc<dyn PostRepository>,
    likes: Arc<dyn LikeRepository>,
    follows: Arc<dyn FollowRepository>,
}

impl FeedAssembler {
    pub fn new(
        users: Arc<dyn UserRepository>,
        posts: Arc<dyn PostRepository>,
        likes: Arc<dyn LikeRepository>,
        follows: Arc<dyn FollowRepository>,
    ) -> Self {
        Self {
            users,
            posts,
            likes,
            follows,
        }
    }

    /// Convenience over [`FeedAssembler::build_feed`] that resolves the
    /// viewer's follow list first.
    pub async fn build_home_feed(&self, viewer_id: Uuid) -> Result<Vec<FeedItem>, RepositoryError> {
        let followed = self.follows.following_ids(viewer_id).await?;
        self.build_feed(viewer_id, &followed).await
    }

    pub async fn build_feed(
        &self,
        viewer_id: Uuid,
        followed_ids: &[Uuid],
    ) -> Result<Vec<FeedItem>, RepositoryError> {
        let mut author_ids = followed_ids.to_vec();
        author_ids.push(viewer_id);

        let mut posts = self.posts.find_by_authors(&author_ids).await?;
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let liked: HashSet<Uuid> = self
            .likes
            .liked_post_ids(viewer_id)
            .await?
            .into_iter()
            .collect();

        // One profile lookup per post is a full round trip; fan the
        // lookups out concurrently and join by index instead of fetching
        // serially.
        let profiles = try_join_all(posts.iter().map(|post| {
            let users = self.users.clone();
            let author_id = post.author_id;
            async move {
                match users.find(author_id).await {
                    Ok(u) => Ok(Some(u)),
                    Err(RepositoryError::NotFound) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }))
        .await?;

        Ok(posts
            .into_iter()
            .zip(profiles)
            .map(|(post, profile)| {
                let liked_by_viewer = liked.contains(&post.id);
                match profile {
                    Some(author) => FeedItem {
                        liked_by_viewer,
                        author_username: author.username,
                        author_picture: author.profile_picture,
                        post,
                    },
                    None => FeedItem {
                        liked_by_viewer,
                        author_username: ANONYMOUS.into(),
                        author_picture: None,
                        post,
                    },
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use smallvec::smallvec;

    use super::*;
    use crate::entities::{Post, User};
    use crate::repositories::mock::InMemoryBackend;

    fn user(username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.into(),
            full_name: username.to_uppercase(),
            email: format!("{}@example.com", username),
            profile_picture: Some(format!("https://cdn.example.com/{}.jpg", username)),
            bio: String::new(),
            followers_count: 0,
            following_count: 0,
            is_private: false,
        }
    }

    fn post(author_id: Uuid, content: &str, age_secs: i64) -> Post {
        let at = Utc::now() - Duration::seconds(age_secs);
        Post {
            id: Uuid::new_v4(),
            author_id,
            content: content.into(),
            media_urls: smallvec![],
            likes_count: 0,
            comments_count: 0,
            created_at: at,
            updated_at: at,
        }
    }

    fn assembler(backend: &Arc<InMemoryBackend>) -> FeedAssembler {
        FeedAssembler::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
        )
    }

    #[tokio::test]
    async fn joins_posts_with_authors_and_like_state() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let followed = user("followed");
        let stranger = user("stranger");
        for u in [&viewer, &followed, &stranger] {
            UserRepository::insert(&*backend, u.clone()).await.unwrap();
        }
        backend
            .set_following(viewer.id, followed.id, true)
            .await
            .unwrap();

        let own = post(viewer.id, "mine", 30);
        let theirs = post(followed.id, "theirs", 10);
        let unseen = post(stranger.id, "strangers", 5);
        for p in [&own, &theirs, &unseen] {
            PostRepository::insert(&*backend, p.clone()).await.unwrap();
        }
        backend.set_liked(viewer.id, theirs.id, true).await.unwrap();

        let feed = assembler(&backend)
            .build_home_feed(viewer.id)
            .await
            .unwrap();

        // Followed authors only, newest first.
        let contents: Vec<_> = feed.iter().map(|i| i.post.content.as_str()).collect();
        assert_eq!(contents, vec!["theirs", "mine"]);

        assert_eq!(feed[0].author_username, "followed");
        assert!(feed[0].liked_by_viewer);
        assert_eq!(feed[0].post.likes_count, 1);
        assert_eq!(feed[1].author_username, "viewer");
        assert!(!feed[1].liked_by_viewer);
    }

    #[tokio::test]
    async fn missing_author_degrades_to_placeholder() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();

        let ghost_author = Uuid::new_v4();
        let orphaned = post(ghost_author, "from nowhere", 1);
        PostRepository::insert(&*backend, orphaned.clone()).await.unwrap();

        let feed = assembler(&backend)
            .build_feed(viewer.id, &[ghost_author])
            .await
            .unwrap();

        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].author_username, ANONYMOUS);
        assert_eq!(feed[0].author_picture, None);
    }

    #[tokio::test]
    async fn empty_follow_list_still_shows_own_posts() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        let own = post(viewer.id, "just me", 1);
        PostRepository::insert(&*backend, own).await.unwrap();

        let feed = assembler(&backend)
            .build_home_feed(viewer.id)
            .await
            .unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].author_username, "viewer");
    }
}
