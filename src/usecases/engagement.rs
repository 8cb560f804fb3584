//! Optimistic like/follow toggles. The local flip always lands before the
//! remote batch is issued; a failed batch restores the exact pre-toggle
//! values and surfaces a non-fatal error. Nothing here retries by itself;
//! re-issuing the action is the user's call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::repositories::{FollowRepository, LikeRepository, RepositoryError};

/// A toggleable entity, used as the re-entrancy key: while a toggle for a
/// subject is in flight, further toggles for the same subject are rejected,
/// not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Post(Uuid),
    User(Uuid),
}

/// Per-subject toggle lifecycle. `Committed` / `RolledBack` record the last
/// resolved outcome and permit the next toggle just like `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TogglePhase {
    Idle,
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Error)]
pub enum EngagementError {
    #[error("a toggle for this subject is still in flight")]
    Busy,
    #[error("remote mutation failed; local state was rolled back")]
    Remote(#[source] RepositoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeToggle {
    pub liked: bool,
    pub likes_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowToggle {
    Following { followers_count: i64 },
    Unfollowed { followers_count: i64 },
    /// Already following: nothing changed and nothing was sent. Call
    /// [`Engagement::confirm_unfollow`] once the user confirms; cancelling
    /// the prompt means simply not calling it.
    ConfirmUnfollow,
}

/// The viewer-local engagement state: membership sets and the denormalized
/// counters currently on screen.
struct Board {
    liked: HashSet<Uuid>,
    likes_count: HashMap<Uuid, i64>,
    following: HashSet<Uuid>,
    followers_count: HashMap<Uuid, i64>,
    own_following_count: i64,
    phases: HashMap<Subject, TogglePhase>,
}

impl Board {
    fn phase(&self, subject: Subject) -> TogglePhase {
        self.phases.get(&subject).copied().unwrap_or(TogglePhase::Idle)
    }
}

pub struct Engagement {
    viewer: Uuid,
    likes: Arc<dyn LikeRepository>,
    follows: Arc<dyn FollowRepository>,
    board: Mutex<Board>,
}

impl Engagement {
    /// Seeds the local membership sets from the store. Counters start
    /// empty and are primed from whatever the screens already fetched.
    pub async fn load(
        viewer: Uuid,
        likes: Arc<dyn LikeRepository>,
        follows: Arc<dyn FollowRepository>,
    ) -> Result<Self, RepositoryError> {
        let liked = likes.liked_post_ids(viewer).await?.into_iter().collect();
        let following = follows.following_ids(viewer).await?.into_iter().collect();

        Ok(Self {
            viewer,
            likes,
            follows,
            board: Mutex::new(Board {
                liked,
                likes_count: HashMap::new(),
                following,
                followers_count: HashMap::new(),
                own_following_count: 0,
                phases: HashMap::new(),
            }),
        })
    }

    pub fn viewer(&self) -> Uuid { self.viewer }

    pub async fn prime_post(&self, post_id: Uuid, likes_count: i64) {
        self.board.lock().await.likes_count.insert(post_id, likes_count);
    }

    pub async fn prime_profile(&self, user_id: Uuid, followers_count: i64) {
        self.board
            .lock()
            .await
            .followers_count
            .insert(user_id, followers_count);
    }

    pub async fn prime_own_following_count(&self, following_count: i64) {
        self.board.lock().await.own_following_count = following_count;
    }

    pub async fn is_liked(&self, post_id: Uuid) -> bool {
        self.board.lock().await.liked.contains(&post_id)
    }

    pub async fn likes_count(&self, post_id: Uuid) -> i64 {
        self.board
            .lock()
            .await
            .likes_count
            .get(&post_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_following(&self, user_id: Uuid) -> bool {
        self.board.lock().await.following.contains(&user_id)
    }

    pub async fn followers_count(&self, user_id: Uuid) -> i64 {
        self.board
            .lock()
            .await
            .followers_count
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn own_following_count(&self) -> i64 {
        self.board.lock().await.own_following_count
    }

    pub async fn phase(&self, subject: Subject) -> TogglePhase {
        self.board.lock().await.phase(subject)
    }

    pub async fn toggle_like(&self, post_id: Uuid) -> Result<LikeToggle, EngagementError> {
        let subject = Subject::Post(post_id);

        // Read local state and flip it before the remote call.
        let (was_liked, prior_count) = {
            let mut board = self.board.lock().await;
            if board.phase(subject) == TogglePhase::Pending {
                return Err(EngagementError::Busy);
            }

            let was_liked = board.liked.contains(&post_id);
            let prior_count = board.likes_count.get(&post_id).copied().unwrap_or(0);

            if was_liked {
                board.liked.remove(&post_id);
            } else {
                board.liked.insert(post_id);
            }
            let flipped = prior_count + if was_liked { -1 } else { 1 };
            if flipped < 0 {
                warn!(%post_id, count = flipped, "likes counter went negative");
            }
            board.likes_count.insert(post_id, flipped);
            board.phases.insert(subject, TogglePhase::Pending);

            (was_liked, prior_count)
        };

        match self.likes.set_liked(self.viewer, post_id, !was_liked).await {
            Ok(()) => {
                let mut board = self.board.lock().await;
                board.phases.insert(subject, TogglePhase::Committed);
                debug!(%post_id, liked = !was_liked, "like toggle committed");

                Ok(LikeToggle {
                    liked: !was_liked,
                    likes_count: board.likes_count.get(&post_id).copied().unwrap_or(0),
                })
            }
            Err(e) => {
                // Exact inverse of the optimistic flip.
                let mut board = self.board.lock().await;
                if was_liked {
                    board.liked.insert(post_id);
                } else {
                    board.liked.remove(&post_id);
                }
                board.likes_count.insert(post_id, prior_count);
                board.phases.insert(subject, TogglePhase::RolledBack);
                warn!(%post_id, error = %e, "like toggle rolled back");

                Err(EngagementError::Remote(e))
            }
        }
    }

    /// Follows when not yet following. When already following, returns
    /// [`FollowToggle::ConfirmUnfollow`] without any state change or
    /// remote call; the actual unfollow runs through
    /// [`Engagement::confirm_unfollow`].
    pub async fn toggle_follow(&self, target_id: Uuid) -> Result<FollowToggle, EngagementError> {
        {
            let board = self.board.lock().await;
            if board.phase(Subject::User(target_id)) == TogglePhase::Pending {
                return Err(EngagementError::Busy);
            }
            if board.following.contains(&target_id) {
                return Ok(FollowToggle::ConfirmUnfollow);
            }
        }

        self.apply_follow(target_id, true).await
    }

    pub async fn confirm_unfollow(&self, target_id: Uuid) -> Result<FollowToggle, EngagementError> {
        {
            let board = self.board.lock().await;
            if board.phase(Subject::User(target_id)) == TogglePhase::Pending {
                return Err(EngagementError::Busy);
            }
            // Confirmed after the state already flipped elsewhere; nothing
            // to undo.
            if !board.following.contains(&target_id) {
                return Ok(FollowToggle::Unfollowed {
                    followers_count: board.followers_count.get(&target_id).copied().unwrap_or(0),
                });
            }
        }

        self.apply_follow(target_id, false).await
    }

    async fn apply_follow(
        &self,
        target_id: Uuid,
        follow: bool,
    ) -> Result<FollowToggle, EngagementError> {
        let subject = Subject::User(target_id);

        let (prior_followers, prior_own_following) = {
            let mut board = self.board.lock().await;
            if board.phase(subject) == TogglePhase::Pending {
                return Err(EngagementError::Busy);
            }

            let prior_followers = board.followers_count.get(&target_id).copied().unwrap_or(0);
            let prior_own_following = board.own_following_count;

            if follow {
                board.following.insert(target_id);
            } else {
                board.following.remove(&target_id);
            }
            let delta = if follow { 1 } else { -1 };
            let flipped = prior_followers + delta;
            if flipped < 0 {
                warn!(user_id = %target_id, count = flipped, "followers counter went negative");
            }
            board.followers_count.insert(target_id, flipped);
            board.own_following_count = prior_own_following + delta;
            board.phases.insert(subject, TogglePhase::Pending);

            (prior_followers, prior_own_following)
        };

        match self
            .follows
            .set_following(self.viewer, target_id, follow)
            .await
        {
            Ok(()) => {
                let mut board = self.board.lock().await;
                board.phases.insert(subject, TogglePhase::Committed);
                debug!(user_id = %target_id, following = follow, "follow toggle committed");

                let followers_count =
                    board.followers_count.get(&target_id).copied().unwrap_or(0);
                Ok(if follow {
                    FollowToggle::Following { followers_count }
                } else {
                    FollowToggle::Unfollowed { followers_count }
                })
            }
            Err(e) => {
                let mut board = self.board.lock().await;
                if follow {
                    board.following.remove(&target_id);
                } else {
                    board.following.insert(target_id);
                }
                board.followers_count.insert(target_id, prior_followers);
                board.own_following_count = prior_own_following;
                board.phases.insert(subject, TogglePhase::RolledBack);
                warn!(user_id = %target_id, error = %e, "follow toggle rolled back");

                Err(EngagementError::Remote(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use smallvec::smallvec;

    use super::*;
    use crate::entities::{Post, User};
    use crate::repositories::mock::InMemoryBackend;
    use crate::repositories::{PostRepository, UserRepository};

    fn user(username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.into(),
            full_name: username.to_uppercase(),
            email: format!("{}@example.com", username),
            profile_picture: None,
            bio: String::new(),
            followers_count: 0,
            following_count: 0,
            is_private: false,
        }
    }

    fn post(author_id: Uuid, likes_count: i64) -> Post {
        let now = Utc::now();
        Post {
            id: Uuid::new_v4(),
            author_id,
            content: "hello".into(),
            media_urls: smallvec![],
            likes_count,
            comments_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn engagement_over(backend: &Arc<InMemoryBackend>, viewer: Uuid) -> Engagement {
        Engagement::load(viewer, backend.clone(), backend.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn like_applies_locally_then_remotely() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let author = user("author");
        let p = post(author.id, 3);
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, author).await.unwrap();
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let engagement = engagement_over(&backend, viewer.id).await;
        engagement.prime_post(p.id, 3).await;

        let outcome = engagement.toggle_like(p.id).await.unwrap();
        assert_eq!(
            outcome,
            LikeToggle {
                liked: true,
                likes_count: 4
            }
        );
        assert!(engagement.is_liked(p.id).await);
        assert_eq!(
            engagement.phase(Subject::Post(p.id)).await,
            TogglePhase::Committed
        );

        assert!(backend.is_liked(viewer.id, p.id).await.unwrap());
        assert_eq!(PostRepository::find(&*backend, p.id).await.unwrap().likes_count, 4);
    }

    #[tokio::test]
    async fn failed_like_rolls_back_to_pre_toggle_values() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let author = user("author");
        let p = post(author.id, 3);
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, author).await.unwrap();
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let engagement = engagement_over(&backend, viewer.id).await;
        engagement.prime_post(p.id, 3).await;

        backend
            .fail_next_write(RepositoryError::Network(::anyhow::anyhow!("wifi died")))
            .await;
        let err = engagement.toggle_like(p.id).await.unwrap_err();
        assert!(matches!(err, EngagementError::Remote(_)));

        assert!(!engagement.is_liked(p.id).await);
        assert_eq!(engagement.likes_count(p.id).await, 3);
        assert_eq!(
            engagement.phase(Subject::Post(p.id)).await,
            TogglePhase::RolledBack
        );

        assert!(!backend.is_liked(viewer.id, p.id).await.unwrap());
        assert_eq!(PostRepository::find(&*backend, p.id).await.unwrap().likes_count, 3);
    }

    #[tokio::test]
    async fn second_toggle_for_same_subject_is_rejected_while_pending() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let author = user("author");
        let p = post(author.id, 0);
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, author).await.unwrap();
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let engagement = Arc::new(engagement_over(&backend, viewer.id).await);
        engagement.prime_post(p.id, 0).await;

        let gate = backend.gate_writes().await;

        let first = tokio::spawn({
            let engagement = engagement.clone();
            let post_id = p.id;
            async move { engagement.toggle_like(post_id).await }
        });

        while engagement.phase(Subject::Post(p.id)).await != TogglePhase::Pending {
            tokio::task::yield_now().await;
        }

        let second = engagement.toggle_like(p.id).await;
        assert!(matches!(second, Err(EngagementError::Busy)));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(
            first,
            LikeToggle {
                liked: true,
                likes_count: 1
            }
        );

        // Exactly one batch landed.
        assert_eq!(PostRepository::find(&*backend, p.id).await.unwrap().likes_count, 1);
        assert_eq!(backend.likers_of(p.id).await.unwrap(), vec![viewer.id]);
    }

    #[tokio::test]
    async fn unlike_decrements_and_removes_edge() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let author = user("author");
        let p = post(author.id, 0);
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, author).await.unwrap();
        PostRepository::insert(&*backend, p.clone()).await.unwrap();

        let engagement = engagement_over(&backend, viewer.id).await;
        engagement.prime_post(p.id, 0).await;

        engagement.toggle_like(p.id).await.unwrap();
        let outcome = engagement.toggle_like(p.id).await.unwrap();
        assert_eq!(
            outcome,
            LikeToggle {
                liked: false,
                likes_count: 0
            }
        );
        assert!(!backend.is_liked(viewer.id, p.id).await.unwrap());
    }

    #[tokio::test]
    async fn unfollow_asks_for_confirmation_first() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let target = user("target");
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, target.clone()).await.unwrap();

        let engagement = engagement_over(&backend, viewer.id).await;
        engagement.prime_profile(target.id, 0).await;

        let outcome = engagement.toggle_follow(target.id).await.unwrap();
        assert_eq!(
            outcome,
            FollowToggle::Following { followers_count: 1 }
        );
        assert!(backend.is_following(viewer.id, target.id).await.unwrap());
        assert_eq!(
            UserRepository::find(&*backend, target.id).await.unwrap().followers_count,
            1
        );
        assert_eq!(
            UserRepository::find(&*backend, viewer.id).await.unwrap().following_count,
            1
        );

        // Toggling again never unfollows directly.
        let outcome = engagement.toggle_follow(target.id).await.unwrap();
        assert_eq!(outcome, FollowToggle::ConfirmUnfollow);
        assert!(backend.is_following(viewer.id, target.id).await.unwrap());
        assert!(engagement.is_following(target.id).await);

        let outcome = engagement.confirm_unfollow(target.id).await.unwrap();
        assert_eq!(
            outcome,
            FollowToggle::Unfollowed { followers_count: 0 }
        );
        assert!(!backend.is_following(viewer.id, target.id).await.unwrap());
        assert_eq!(
            UserRepository::find(&*backend, target.id).await.unwrap().followers_count,
            0
        );
    }

    #[tokio::test]
    async fn failed_follow_restores_both_counters() {
        let backend = Arc::new(InMemoryBackend::new());
        let viewer = user("viewer");
        let target = user("target");
        UserRepository::insert(&*backend, viewer.clone()).await.unwrap();
        UserRepository::insert(&*backend, target.clone()).await.unwrap();

        let engagement = engagement_over(&backend, viewer.id).await;
        engagement.prime_profile(target.id, 7).await;
        engagement.prime_own_following_count(2).await;

        backend
            .fail_next_write(RepositoryError::PermissionDenied)
            .await;
        let err = engagement.toggle_follow(target.id).await.unwrap_err();
        assert!(matches!(err, EngagementError::Remote(_)));

        assert!(!engagement.is_following(target.id).await);
        assert_eq!(engagement.followers_count(target.id).await, 7);
        assert_eq!(engagement.own_following_count().await, 2);
        assert!(!backend.is_following(viewer.id, target.id).await.unwrap());
    }
}
