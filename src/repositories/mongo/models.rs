//! Store-side record shapes. Documents travel as these models and only
//! become entities through the fallible conversions below, so a corrupt
//! document surfaces as `RepositoryError::Decode` instead of a silently
//! defaulted field.

use std::convert::TryFrom;

use mongodb::bson::{self, doc, Document};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use super::super::{ProfileMutation, RepositoryError};
use crate::entities::{Comment, FollowEdge, Like, Message, Post, User};

fn parse_id(raw: &str, field: &str) -> Result<Uuid, RepositoryError> {
    raw.parse()
        .map_err(|_| RepositoryError::Decode(format!("`{}` is not a uuid: `{}`", field, raw)))
}

pub(super) fn edge_key(a: Uuid, b: Uuid) -> String { format!("{}_{}", a, b) }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoUserModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub profile_picture: Option<String>,
    pub bio: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub is_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoPostModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub media_urls: Vec<String>,
    pub likes_count: i64,
    pub comments_count: i64,
    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoCommentModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: bson::DateTime,
    pub parent_id: Option<String>,
}

/// `_id` is the composite `"{user_id}_{post_id}"`; the unique key makes a
/// duplicate like a store-level conflict rather than a double count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoLikeModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub post_id: String,
    pub created_at: bson::DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoFollowModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub follower_id: String,
    pub followed_id: String,
    pub created_at: bson::DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MongoMessageModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: bson::DateTime,
}

impl From<ProfileMutation> for Document {
    fn from(
        ProfileMutation {
            full_name,
            bio,
            profile_picture,
            is_private,
        }: ProfileMutation,
    ) -> Self {
        let mut mutation = doc! {};

        if let Some(val) = full_name {
            mutation.insert("full_name", val);
        }
        if let Some(val) = bio {
            mutation.insert("bio", val);
        }
        if let Some(val) = profile_picture {
            mutation.insert("profile_picture", val);
        }
        if let Some(val) = is_private {
            mutation.insert("is_private", val);
        }

        mutation
    }
}

impl TryFrom<MongoUserModel> for User {
    type Error = RepositoryError;

    fn try_from(
        MongoUserModel {
            id,
            username,
            full_name,
            email,
            profile_picture,
            bio,
            followers_count,
            following_count,
            is_private,
        }: MongoUserModel,
    ) -> Result<Self, Self::Error> {
        Ok(User {
            id: parse_id(&id, "_id")?,
            username,
            full_name,
            email,
            profile_picture,
            bio,
            followers_count,
            following_count,
            is_private,
        })
    }
}

impl From<User> for MongoUserModel {
    fn from(
        User {
            id,
            username,
            full_name,
            email,
            profile_picture,
            bio,
            followers_count,
            following_count,
            is_private,
        }: User,
    ) -> Self {
        MongoUserModel {
            id: id.to_string(),
            username,
            full_name,
            email,
            profile_picture,
            bio,
            followers_count,
            following_count,
            is_private,
        }
    }
}

impl TryFrom<MongoPostModel> for Post {
    type Error = RepositoryError;

    fn try_from(
        MongoPostModel {
            id,
            author_id,
            content,
            media_urls,
            likes_count,
            comments_count,
            created_at,
            updated_at,
        }: MongoPostModel,
    ) -> Result<Self, Self::Error> {
        Ok(Post {
            id: parse_id(&id, "_id")?,
            author_id: parse_id(&author_id, "author_id")?,
            content,
            media_urls: SmallVec::from_vec(media_urls),
            likes_count,
            comments_count,
            created_at: created_at.to_chrono(),
            updated_at: updated_at.to_chrono(),
        })
    }
}

impl From<Post> for MongoPostModel {
    fn from(
        Post {
            id,
            author_id,
            content,
            media_urls,
            likes_count,
            comments_count,
            created_at,
            updated_at,
        }: Post,
    ) -> Self {
        MongoPostModel {
            id: id.to_string(),
            author_id: author_id.to_string(),
            content,
            media_urls: media_urls.into_vec(),
            likes_count,
            comments_count,
            created_at: bson::DateTime::from_chrono(created_at),
            updated_at: bson::DateTime::from_chrono(updated_at),
        }
    }
}

impl TryFrom<MongoCommentModel> for Comment {
    type Error = RepositoryError;

    fn try_from(
        MongoCommentModel {
            id,
            post_id,
            author_id,
            text,
            created_at,
            parent_id,
        }: MongoCommentModel,
    ) -> Result<Self, Self::Error> {
        Ok(Comment {
            id: parse_id(&id, "_id")?,
            post_id: parse_id(&post_id, "post_id")?,
            author_id: parse_id(&author_id, "author_id")?,
            text,
            created_at: created_at.to_chrono(),
            parent_id: parent_id
                .map(|raw| parse_id(&raw, "parent_id"))
                .transpose()?,
        })
    }
}

impl From<Comment> for MongoCommentModel {
    fn from(
        Comment {
            id,
            post_id,
            author_id,
            text,
            created_at,
            parent_id,
        }: Comment,
    ) -> Self {
        MongoCommentModel {
            id: id.to_string(),
            post_id: post_id.to_string(),
            author_id: author_id.to_string(),
            text,
            created_at: bson::DateTime::from_chrono(created_at),
            parent_id: parent_id.map(|p| p.to_string()),
        }
    }
}

impl TryFrom<MongoLikeModel> for Like {
    type Error = RepositoryError;

    fn try_from(
        MongoLikeModel {
            id: _,
            user_id,
            post_id,
            created_at,
        }: MongoLikeModel,
    ) -> Result<Self, Self::Error> {
        Ok(Like {
            user_id: parse_id(&user_id, "user_id")?,
            post_id: parse_id(&post_id, "post_id")?,
            created_at: created_at.to_chrono(),
        })
    }
}

impl From<Like> for MongoLikeModel {
    fn from(
        Like {
            user_id,
            post_id,
            created_at,
        }: Like,
    ) -> Self {
        MongoLikeModel {
            id: edge_key(user_id, post_id),
            user_id: user_id.to_string(),
            post_id: post_id.to_string(),
            created_at: bson::DateTime::from_chrono(created_at),
        }
    }
}

impl TryFrom<MongoFollowModel> for FollowEdge {
    type Error = RepositoryError;

    fn try_from(
        MongoFollowModel {
            id: _,
            follower_id,
            followed_id,
            created_at,
        }: MongoFollowModel,
    ) -> Result<Self, Self::Error> {
        Ok(FollowEdge {
            follower_id: parse_id(&follower_id, "follower_id")?,
            followed_id: parse_id(&followed_id, "followed_id")?,
            created_at: created_at.to_chrono(),
        })
    }
}

impl From<FollowEdge> for MongoFollowModel {
    fn from(
        FollowEdge {
            follower_id,
            followed_id,
            created_at,
        }: FollowEdge,
    ) -> Self {
        MongoFollowModel {
            id: edge_key(follower_id, followed_id),
            follower_id: follower_id.to_string(),
            followed_id: followed_id.to_string(),
            created_at: bson::DateTime::from_chrono(created_at),
        }
    }
}

impl TryFrom<MongoMessageModel> for Message {
    type Error = RepositoryError;

    fn try_from(
        MongoMessageModel {
            id: _,
            sender_id,
            receiver_id,
            content,
            created_at,
        }: MongoMessageModel,
    ) -> Result<Self, Self::Error> {
        Ok(Message {
            sender_id: parse_id(&sender_id, "sender_id")?,
            receiver_id: parse_id(&receiver_id, "receiver_id")?,
            content,
            created_at: created_at.to_chrono(),
        })
    }
}
