use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use uuid::Uuid;

use super::{
    MessageRepository, MessageSubscription, ProfileMutation, RepositoryError, Result,
    CommentRepository, FollowRepository, LikeRepository, PostRepository, UserRepository,
};
use crate::entities::{Comment, FollowEdge, Like, Message, Post, User};

/// In-memory stand-in for the vendor store. One mutex over the whole store
/// because atomic batches span collections (edge record + counter on
/// another document); per-collection locks could not apply them
/// all-or-nothing.
pub struct InMemoryBackend {
    store: Mutex<Store>,
    fault: Mutex<Option<RepositoryError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    messages_tx: watch::Sender<Vec<Message>>,
}

#[derive(Default)]
struct Store {
    users: Vec<User>,
    posts: Vec<Post>,
    comments: Vec<Comment>,
    likes: Vec<Like>,
    follows: Vec<FollowEdge>,
    messages: Vec<Message>,
}

fn find_one<'a, T>(items: &'a [T], pred: impl Fn(&T) -> bool) -> Result<&'a T> {
    items
        .iter()
        .find(|v| pred(*v))
        .ok_or(RepositoryError::NotFound)
}

fn find_one_mut<'a, T>(items: &'a mut [T], pred: impl Fn(&T) -> bool) -> Result<&'a mut T> {
    items
        .iter_mut()
        .find(|v| pred(*v))
        .ok_or(RepositoryError::NotFound)
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (messages_tx, _) = watch::channel(vec![]);

        Self {
            store: Mutex::new(Store::default()),
            fault: Mutex::new(None),
            gate: Mutex::new(None),
            messages_tx,
        }
    }

    /// Makes the next mutating call fail with `err` before touching any
    /// state, simulating a remote batch failure.
    pub async fn fail_next_write(&self, err: RepositoryError) {
        *self.fault.lock().await = Some(err);
    }

    /// Holds the next mutating call until the returned `Notify` is
    /// notified. Lets tests observe the window while a write is in flight.
    pub async fn gate_writes(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().await = Some(notify.clone());
        notify
    }

    /// Entry point of every mutating operation: first serve a pending
    /// gate, then a pending injected fault. Runs before any state change
    /// so a failed batch leaves the store untouched.
    async fn checkpoint(&self) -> Result<()> {
        let gate = self.gate.lock().await.take();
        if let Some(notify) = gate {
            notify.notified().await;
        }

        match self.fault.lock().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl UserRepository for InMemoryBackend {
    async fn insert(&self, user: User) -> Result<bool> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        if store.users.iter().any(|u| u.id == user.id) {
            return Ok(false);
        }
        if store.users.iter().any(|u| u.username == user.username) {
            return Err(RepositoryError::Conflict(format!(
                "username `{}` already taken",
                user.username
            )));
        }

        store.users.push(user);
        Ok(true)
    }

    async fn find(&self, id: Uuid) -> Result<User> {
        let store = self.store.lock().await;

        Ok(find_one(&store.users, |u| u.id == id)?.clone())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let store = self.store.lock().await;

        Ok(store
            .users
            .iter()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn search(&self, username_prefix: &str) -> Result<Vec<User>> {
        let store = self.store.lock().await;

        Ok(store
            .users
            .iter()
            .filter(|u| u.username.starts_with(username_prefix))
            .cloned()
            .collect())
    }

    async fn update_profile(&self, id: Uuid, mutation: ProfileMutation) -> Result<User> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;
        let user = find_one_mut(&mut store.users, |u| u.id == id)?;

        let ProfileMutation {
            full_name,
            bio,
            profile_picture,
            is_private,
        } = mutation;
        if let Some(val) = full_name {
            user.full_name = val;
        }
        if let Some(val) = bio {
            user.bio = val;
        }
        if let Some(val) = profile_picture {
            user.profile_picture = Some(val);
        }
        if let Some(val) = is_private {
            user.is_private = val;
        }

        Ok(user.clone())
    }
}

#[async_trait]
impl PostRepository for InMemoryBackend {
    async fn insert(&self, post: Post) -> Result<()> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        if store.posts.iter().any(|p| p.id == post.id) {
            return Err(RepositoryError::Conflict(format!(
                "post `{}` already exists",
                post.id
            )));
        }

        store.posts.push(post);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Post> {
        let store = self.store.lock().await;

        Ok(find_one(&store.posts, |p| p.id == id)?.clone())
    }

    async fn find_by_authors(&self, author_ids: &[Uuid]) -> Result<Vec<Post>> {
        let store = self.store.lock().await;

        Ok(store
            .posts
            .iter()
            .filter(|p| author_ids.contains(&p.author_id))
            .cloned()
            .collect())
    }

    async fn edit_content(&self, id: Uuid, content: String) -> Result<Post> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;
        let post = find_one_mut(&mut store.posts, |p| p.id == id)?;

        post.content = content;
        post.updated_at = Utc::now();

        Ok(post.clone())
    }
}

#[async_trait]
impl CommentRepository for InMemoryBackend {
    async fn insert(&self, comment: Comment) -> Result<()> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        // Validate before mutating; the comment and the counter bump land
        // together or not at all.
        find_one(&store.posts, |p| p.id == comment.post_id)?;

        let post_id = comment.post_id;
        store.comments.push(comment);
        find_one_mut(&mut store.posts, |p| p.id == post_id)?.comments_count += 1;

        Ok(())
    }

    async fn find_by_post(&self, post_id: Uuid) -> Result<Vec<Comment>> {
        let store = self.store.lock().await;

        Ok(store
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LikeRepository for InMemoryBackend {
    async fn is_liked(&self, user_id: Uuid, post_id: Uuid) -> Result<bool> {
        let store = self.store.lock().await;

        Ok(store
            .likes
            .iter()
            .any(|l| l.user_id == user_id && l.post_id == post_id))
    }

    async fn liked_post_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let store = self.store.lock().await;

        Ok(store
            .likes
            .iter()
            .filter(|l| l.user_id == user_id)
            .map(|l| l.post_id)
            .collect())
    }

    async fn likers_of(&self, post_id: Uuid) -> Result<Vec<Uuid>> {
        let store = self.store.lock().await;

        Ok(store
            .likes
            .iter()
            .filter(|l| l.post_id == post_id)
            .map(|l| l.user_id)
            .collect())
    }

    async fn set_liked(&self, user_id: Uuid, post_id: Uuid, liked: bool) -> Result<()> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        let exists = store
            .likes
            .iter()
            .any(|l| l.user_id == user_id && l.post_id == post_id);
        find_one(&store.posts, |p| p.id == post_id)?;

        match (liked, exists) {
            (true, true) => {
                return Err(RepositoryError::Conflict(format!(
                    "like `{}_{}` already exists",
                    user_id, post_id
                )))
            }
            (false, false) => return Err(RepositoryError::NotFound),
            (true, false) => {
                store.likes.push(Like {
                    user_id,
                    post_id,
                    created_at: Utc::now(),
                });
                find_one_mut(&mut store.posts, |p| p.id == post_id)?.likes_count += 1;
            }
            (false, true) => {
                store
                    .likes
                    .retain(|l| !(l.user_id == user_id && l.post_id == post_id));
                find_one_mut(&mut store.posts, |p| p.id == post_id)?.likes_count -= 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl FollowRepository for InMemoryBackend {
    async fn is_following(&self, follower_id: Uuid, followed_id: Uuid) -> Result<bool> {
        let store = self.store.lock().await;

        Ok(store
            .follows
            .iter()
            .any(|f| f.follower_id == follower_id && f.followed_id == followed_id))
    }

    async fn following_ids(&self, follower_id: Uuid) -> Result<Vec<Uuid>> {
        let store = self.store.lock().await;

        Ok(store
            .follows
            .iter()
            .filter(|f| f.follower_id == follower_id)
            .map(|f| f.followed_id)
            .collect())
    }

    async fn follower_ids(&self, followed_id: Uuid) -> Result<Vec<Uuid>> {
        let store = self.store.lock().await;

        Ok(store
            .follows
            .iter()
            .filter(|f| f.followed_id == followed_id)
            .map(|f| f.follower_id)
            .collect())
    }

    async fn set_following(
        &self,
        follower_id: Uuid,
        followed_id: Uuid,
        following: bool,
    ) -> Result<()> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        let exists = store
            .follows
            .iter()
            .any(|f| f.follower_id == follower_id && f.followed_id == followed_id);
        find_one(&store.users, |u| u.id == follower_id)?;
        find_one(&store.users, |u| u.id == followed_id)?;

        match (following, exists) {
            (true, true) => {
                return Err(RepositoryError::Conflict(format!(
                    "follow `{}_{}` already exists",
                    follower_id, followed_id
                )))
            }
            (false, false) => return Err(RepositoryError::NotFound),
            (true, false) => {
                store.follows.push(FollowEdge {
                    follower_id,
                    followed_id,
                    created_at: Utc::now(),
                });
                find_one_mut(&mut store.users, |u| u.id == followed_id)?.followers_count += 1;
                find_one_mut(&mut store.users, |u| u.id == follower_id)?.following_count += 1;
            }
            (false, true) => {
                store
                    .follows
                    .retain(|f| !(f.follower_id == follower_id && f.followed_id == followed_id));
                find_one_mut(&mut store.users, |u| u.id == followed_id)?.followers_count -= 1;
                find_one_mut(&mut store.users, |u| u.id == follower_id)?.following_count -= 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageRepository for InMemoryBackend {
    async fn send(&self, sender_id: Uuid, receiver_id: Uuid, content: String) -> Result<Message> {
        self.checkpoint().await?;
        let mut store = self.store.lock().await;

        let message = Message {
            sender_id,
            receiver_id,
            content,
            created_at: Utc::now(),
        };
        store.messages.push(message.clone());

        // send_replace updates the snapshot even while nobody subscribes.
        self.messages_tx.send_replace(store.messages.clone());

        Ok(message)
    }

    async fn subscribe(&self) -> Result<MessageSubscription> {
        Ok(MessageSubscription::new(self.messages_tx.subscribe(), || {}))
    }
}
