use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use uuid::Uuid;

/// A registered account. `followers_count` / `following_count` are
/// denormalized caches of the follow-edge collection; they are only
/// mutated together with the matching edge write.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub profile_picture: Option<String>,
    pub bio: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub media_urls: SmallVec<[String; 4]>,
    pub likes_count: i64,
    pub comments_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Edge record keyed by `(user_id, post_id)`. Existence of the record is
/// the like state; the pair key doubles as the idempotency guard.
#[derive(Debug, Clone, PartialEq)]
pub struct Like {
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Edge record keyed by `(follower_id, followed_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowEdge {
    pub follower_id: Uuid,
    pub followed_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Immutable once created. `parent_id == None` marks a root comment; the
/// back-reference is a relation only, never ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
}

/// Immutable once created. `created_at` is assigned by the store at write
/// time and is the authoritative ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
