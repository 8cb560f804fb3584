//! Vendor-store implementations of the gateway traits. Cross-document
//! batches (edge record + counter) run inside session transactions and are
//! retried on the driver's transient labels.

use std::convert::TryFrom;
use std::convert::TryInto;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::error::{
    ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use super::{
    CommentRepository, FollowRepository, LikeRepository, MessageRepository, MessageSubscription,
    PostRepository, ProfileMutation, RepositoryError, Result, UserRepository,
};
use crate::entities::{Comment, FollowEdge, Like, Message, Post, User};

mod models;

use models::{
    edge_key, MongoCommentModel, MongoFollowModel, MongoLikeModel, MongoMessageModel,
    MongoPostModel, MongoUserModel,
};

fn classify(e: mongodb::error::Error) -> RepositoryError {
    match &*e.kind {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000 => {
            RepositoryError::Conflict(we.message.clone())
        }
        ErrorKind::Command(c) if c.code == 13 => RepositoryError::PermissionDenied,
        ErrorKind::Authentication { .. } => RepositoryError::PermissionDenied,
        _ => RepositoryError::Network(::anyhow::Error::new(e)),
    }
}

trait CvtExt<T> {
    fn cvt(self) -> Result<T>;
}
impl<T> CvtExt<T> for ::mongodb::error::Result<T> {
    fn cvt(self) -> Result<T> { self.map_err(classify) }
}

trait OptExt<T> {
    fn opt_cvt(self) -> Result<T>;
}
impl<T> OptExt<T> for Option<T> {
    fn opt_cvt(self) -> Result<T> { self.ok_or(RepositoryError::NotFound) }
}

async fn collect_entities<M, E>(cursor: ::mongodb::Cursor<M>) -> Result<Vec<E>>
where
    M: ::serde::de::DeserializeOwned + Unpin + Send + Sync,
    E: TryFrom<M, Error = RepositoryError>,
{
    cursor
        .try_collect::<Vec<_>>()
        .await
        .cvt()?
        .into_iter()
        .map(E::try_from)
        .collect()
}

pub struct MongoUserRepository {
    coll: Collection<MongoUserModel>,
}

impl MongoUserRepository {
    pub async fn new_with(db: &Database) -> ::anyhow::Result<Self> {
        db.run_command(
            doc! {
                "createIndexes": "users",
                "indexes": [{
                    "name": "unique_username",
                    "key": { "username": 1 },
                    "unique": true
                }],
            },
            None,
        )
        .await?;

        Ok(Self {
            coll: db.collection("users"),
        })
    }
}

#[async_trait]
impl UserRepository for MongoUserRepository {
    async fn insert(&self, user: User) -> Result<bool> {
        let model: MongoUserModel = user.into();

        match self.coll.insert_one(model, None).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e) {
                // Same `_id` raced us; the caller treats that as "taken".
                RepositoryError::Conflict(msg) if msg.contains("_id") => Ok(false),
                e => Err(e),
            },
        }
    }

    async fn find(&self, id: Uuid) -> Result<User> {
        self.coll
            .find_one(doc! { "_id": id.to_string() }, None)
            .await
            .cvt()?
            .opt_cvt()?
            .try_into()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        self.coll
            .find_one(doc! { "username": username }, None)
            .await
            .cvt()?
            .map(User::try_from)
            .transpose()
    }

    async fn search(&self, username_prefix: &str) -> Result<Vec<User>> {
        let filter = doc! {
            "username": { "$regex": format!("^{}", ::regex::escape(username_prefix)) }
        };

        let cursor = self.coll.find(filter, None).await.cvt()?;
        collect_entities(cursor).await
    }

    async fn update_profile(&self, id: Uuid, mutation: ProfileMutation) -> Result<User> {
        let mutation_doc: Document = mutation.into();
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.coll
            .find_one_and_update(
                doc! { "_id": id.to_string() },
                doc! { "$set": mutation_doc },
                options,
            )
            .await
            .cvt()?
            .opt_cvt()?
            .try_into()
    }
}

pub struct MongoPostRepository {
    coll: Collection<MongoPostModel>,
}

impl MongoPostRepository {
    pub fn new_with(db: &Database) -> Self {
        Self {
            coll: db.collection("posts"),
        }
    }
}

#[async_trait]
impl PostRepository for MongoPostRepository {
    async fn insert(&self, post: Post) -> Result<()> {
        let model: MongoPostModel = post.into();

        self.coll.insert_one(model, None).await.cvt()?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Post> {
        self.coll
            .find_one(doc! { "_id": id.to_string() }, None)
            .await
            .cvt()?
            .opt_cvt()?
            .try_into()
    }

    async fn find_by_authors(&self, author_ids: &[Uuid]) -> Result<Vec<Post>> {
        let ids = author_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>();

        let cursor = self
            .coll
            .find(doc! { "author_id": { "$in": ids } }, None)
            .await
            .cvt()?;
        collect_entities(cursor).await
    }

    async fn edit_content(&self, id: Uuid, content: String) -> Result<Post> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.coll
            .find_one_and_update(
                doc! { "_id": id.to_string() },
                doc! { "$set": {
                    "content": content,
                    "updated_at": ::mongodb::bson::DateTime::now(),
                } },
                options,
            )
            .await
            .cvt()?
            .opt_cvt()?
            .try_into()
    }
}

pub struct MongoCommentRepository {
    client: Client,
    comments: Collection<MongoCommentModel>,
    posts: Collection<MongoPostModel>,
}

impl MongoCommentRepository {
    pub fn new_with(client: Client, db: &Database) -> Self {
        Self {
            client,
            comments: db.collection("comments"),
            posts: db.collection("posts"),
        }
    }
}

#[async_trait]
impl CommentRepository for MongoCommentRepository {
    async fn insert(&self, comment: Comment) -> Result<()> {
        let model: MongoCommentModel = comment.into();

        async fn transaction(
            this: &MongoCommentRepository,
            model: MongoCommentModel,
        ) -> ::mongodb::error::Result<Option<()>> {
            let mut session = this.client.start_session(None).await?;
            session.start_transaction(None).await?;

            let matched = this
                .posts
                .update_one_with_session(
                    doc! { "_id": &model.post_id },
                    doc! { "$inc": { "comments_count": 1 } },
                    None,
                    &mut session,
                )
                .await?
                .matched_count;
            if matched == 0 {
                session.abort_transaction().await?;
                return Ok(None);
            }

            this.comments
                .insert_one_with_session(model, None, &mut session)
                .await?;

            loop {
                let r = session.commit_transaction().await;
                if let Err(ref e) = r {
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
                        continue;
                    }
                }

                break r.map(|_| Some(()));
            }
        }

        let res = loop {
            let r = transaction(self, model.clone()).await;
            if let Err(ref e) = r {
                if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    continue;
                }
            }

            break r;
        };

        res.cvt()?.opt_cvt()
    }

    async fn find_by_post(&self, post_id: Uuid) -> Result<Vec<Comment>> {
        let cursor = self
            .comments
            .find(doc! { "post_id": post_id.to_string() }, None)
            .await
            .cvt()?;
        collect_entities(cursor).await
    }
}

pub struct MongoLikeRepository {
    client: Client,
    likes: Collection<MongoLikeModel>,
    posts: Collection<MongoPostModel>,
}

impl MongoLikeRepository {
    pub fn new_with(client: Client, db: &Database) -> Self {
        Self {
            client,
            likes: db.collection("likes"),
            posts: db.collection("posts"),
        }
    }
}

#[async_trait]
impl LikeRepository for MongoLikeRepository {
    async fn is_liked(&self, user_id: Uuid, post_id: Uuid) -> Result<bool> {
        let n = self
            .likes
            .count_documents(doc! { "_id": edge_key(user_id, post_id) }, None)
            .await
            .cvt()?;

        Ok(n > 0)
    }

    async fn liked_post_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let cursor = self
            .likes
            .find(doc! { "user_id": user_id.to_string() }, None)
            .await
            .cvt()?;

        let likes: Vec<Like> = collect_entities(cursor).await?;
        Ok(likes.into_iter().map(|l| l.post_id).collect())
    }

    async fn likers_of(&self, post_id: Uuid) -> Result<Vec<Uuid>> {
        let cursor = self
            .likes
            .find(doc! { "post_id": post_id.to_string() }, None)
            .await
            .cvt()?;

        let likes: Vec<Like> = collect_entities(cursor).await?;
        Ok(likes.into_iter().map(|l| l.user_id).collect())
    }

    async fn set_liked(&self, user_id: Uuid, post_id: Uuid, liked: bool) -> Result<()> {
        async fn transaction(
            this: &MongoLikeRepository,
            user_id: Uuid,
            post_id: Uuid,
            liked: bool,
        ) -> ::mongodb::error::Result<Option<()>> {
            let mut session = this.client.start_session(None).await?;
            session.start_transaction(None).await?;

            if liked {
                let model: MongoLikeModel = Like {
                    user_id,
                    post_id,
                    created_at: Utc::now(),
                }
                .into();
                this.likes
                    .insert_one_with_session(model, None, &mut session)
                    .await?;
            } else {
                let deleted = this
                    .likes
                    .delete_one_with_session(
                        doc! { "_id": edge_key(user_id, post_id) },
                        None,
                        &mut session,
                    )
                    .await?
                    .deleted_count;
                if deleted == 0 {
                    session.abort_transaction().await?;
                    return Ok(None);
                }
            }

            let delta: i64 = if liked { 1 } else { -1 };
            let matched = this
                .posts
                .update_one_with_session(
                    doc! { "_id": post_id.to_string() },
                    doc! { "$inc": { "likes_count": delta } },
                    None,
                    &mut session,
                )
                .await?
                .matched_count;
            if matched == 0 {
                session.abort_transaction().await?;
                return Ok(None);
            }

            loop {
                let r = session.commit_transaction().await;
                if let Err(ref e) = r {
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
                        continue;
                    }
                }

                break r.map(|_| Some(()));
            }
        }

        let res = loop {
            let r = transaction(self, user_id, post_id, liked).await;
            if let Err(ref e) = r {
                if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    continue;
                }
            }

            break r;
        };

        res.cvt()?.opt_cvt()
    }
}

pub struct MongoFollowRepository {
    client: Client,
    follows: Collection<MongoFollowModel>,
    users: Collection<MongoUserModel>,
}

impl MongoFollowRepository {
    pub fn new_with(client: Client, db: &Database) -> Self {
        Self {
            client,
            follows: db.collection("followers"),
            users: db.collection("users"),
        }
    }
}

#[async_trait]
impl FollowRepository for MongoFollowRepository {
    async fn is_following(&self, follower_id: Uuid, followed_id: Uuid) -> Result<bool> {
        let n = self
            .follows
            .count_documents(doc! { "_id": edge_key(follower_id, followed_id) }, None)
            .await
            .cvt()?;

        Ok(n > 0)
    }

    async fn following_ids(&self, follower_id: Uuid) -> Result<Vec<Uuid>> {
        let cursor = self
            .follows
            .find(doc! { "follower_id": follower_id.to_string() }, None)
            .await
            .cvt()?;

        let edges: Vec<FollowEdge> = collect_entities(cursor).await?;
        Ok(edges.into_iter().map(|f| f.followed_id).collect())
    }

    async fn follower_ids(&self, followed_id: Uuid) -> Result<Vec<Uuid>> {
        let cursor = self
            .follows
            .find(doc! { "followed_id": followed_id.to_string() }, None)
            .await
            .cvt()?;

        let edges: Vec<FollowEdge> = collect_entities(cursor).await?;
        Ok(edges.into_iter().map(|f| f.follower_id).collect())
    }

    async fn set_following(
        &self,
        follower_id: Uuid,
        followed_id: Uuid,
        following: bool,
    ) -> Result<()> {
        async fn transaction(
            this: &MongoFollowRepository,
            follower_id: Uuid,
            followed_id: Uuid,
            following: bool,
        ) -> ::mongodb::error::Result<Option<()>> {
            let mut session = this.client.start_session(None).await?;
            session.start_transaction(None).await?;

            if following {
                let model: MongoFollowModel = FollowEdge {
                    follower_id,
                    followed_id,
                    created_at: Utc::now(),
                }
                .into();
                this.follows
                    .insert_one_with_session(model, None, &mut session)
                    .await?;
            } else {
                let deleted = this
                    .follows
                    .delete_one_with_session(
                        doc! { "_id": edge_key(follower_id, followed_id) },
                        None,
                        &mut session,
                    )
                    .await?
                    .deleted_count;
                if deleted == 0 {
                    session.abort_transaction().await?;
                    return Ok(None);
                }
            }

            let delta: i64 = if following { 1 } else { -1 };
            for (id, field) in [
                (followed_id, "followers_count"),
                (follower_id, "following_count"),
            ] {
                let matched = this
                    .users
                    .update_one_with_session(
                        doc! { "_id": id.to_string() },
                        doc! { "$inc": { field: delta } },
                        None,
                        &mut session,
                    )
                    .await?
                    .matched_count;
                if matched == 0 {
                    session.abort_transaction().await?;
                    return Ok(None);
                }
            }

            loop {
                let r = session.commit_transaction().await;
                if let Err(ref e) = r {
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
                        continue;
                    }
                }

                break r.map(|_| Some(()));
            }
        }

        let res = loop {
            let r = transaction(self, follower_id, followed_id, following).await;
            if let Err(ref e) = r {
                if e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    continue;
                }
            }

            break r;
        };

        res.cvt()?.opt_cvt()
    }
}

pub struct MongoMessageRepository {
    coll: Collection<MongoMessageModel>,
}

impl MongoMessageRepository {
    pub fn new_with(db: &Database) -> Self {
        Self {
            coll: db.collection("messages"),
        }
    }
}

async fn fetch_messages(coll: &Collection<MongoMessageModel>) -> Result<Vec<Message>> {
    let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();

    let cursor = coll.find(None, options).await.cvt()?;
    collect_entities(cursor).await
}

#[async_trait]
impl MessageRepository for MongoMessageRepository {
    async fn send(&self, sender_id: Uuid, receiver_id: Uuid, content: String) -> Result<Message> {
        // The store assigns the timestamp at write time; callers never
        // supply it.
        let message = Message {
            sender_id,
            receiver_id,
            content,
            created_at: Utc::now(),
        };

        let model = MongoMessageModel {
            id: Uuid::new_v4().to_string(),
            sender_id: message.sender_id.to_string(),
            receiver_id: message.receiver_id.to_string(),
            content: message.content.clone(),
            created_at: ::mongodb::bson::DateTime::from_chrono(message.created_at),
        };
        self.coll.insert_one(model, None).await.cvt()?;

        Ok(message)
    }

    async fn subscribe(&self) -> Result<MessageSubscription> {
        let initial = fetch_messages(&self.coll).await?;
        let (tx, rx) = watch::channel(initial);

        let coll = self.coll.clone();
        let pump = tokio::spawn(async move {
            let mut stream = match coll.watch(Vec::<Document>::new(), None).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "message change stream failed to open");
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "message change stream broke");
                    break;
                }

                // Any change invalidates the snapshot wholesale; requery
                // rather than patch.
                match fetch_messages(&coll).await {
                    Ok(snapshot) => {
                        tx.send_replace(snapshot);
                    }
                    Err(e) => {
                        warn!(error = %e, "message snapshot refresh failed");
                        break;
                    }
                }
            }
        });

        Ok(MessageSubscription::new(rx, move || pump.abort()))
    }
}
