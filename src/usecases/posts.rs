//! Post publishing and editing. Media goes out first, one file at a
//! time; the post document is only written once every upload has a
//! hosted URL.

use std::sync::Arc;

use chrono::Utc;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::entities::Post;
use crate::media::{MediaError, MediaUploader};
use crate::repositories::{PostRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("a post needs text or at least one image")]
    Empty,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Remote(#[from] RepositoryError),
}

/// One image attached to a draft, still as raw bytes.
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub filename: String,
}

pub struct Publisher {
    posts: Arc<dyn PostRepository>,
    uploader: Arc<dyn MediaUploader>,
}

impl Publisher {
    pub fn new(posts: Arc<dyn PostRepository>, uploader: Arc<dyn MediaUploader>) -> Self {
        Self { posts, uploader }
    }

    /// Uploads each attachment in order, then persists the post carrying
    /// the returned URLs. Any upload failure aborts the whole publish and
    /// nothing is written.
    pub async fn publish(
        &self,
        author_id: Uuid,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Post, PostError> {
        let content = content.trim();
        if content.is_empty() && attachments.is_empty() {
            return Err(PostError::Empty);
        }

        let mut media_urls = SmallVec::new();
        for attachment in attachments {
            let url = self
                .uploader
                .upload(attachment.bytes, &attachment.filename)
                .await?;
            media_urls.push(url);
        }

        let now = Utc::now();
        let post = Post {
            id: Uuid::new_v4(),
            author_id,
            content: content.to_owned(),
            media_urls,
            likes_count: 0,
            comments_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.posts.insert(post.clone()).await?;
        tracing::info!(post_id = %post.id, media = post.media_urls.len(), "published post");
        Ok(post)
    }

    /// Edits only the text. Media on a published post is immutable.
    pub async fn edit_content(&self, post_id: Uuid, content: &str) -> Result<Post, PostError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PostError::Empty);
        }
        Ok(self.posts.edit_content(post_id, content.to_owned()).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::repositories::mock::InMemoryBackend;

    /// Records filenames and mints one URL per call, failing after a set
    /// number of successes.
    struct CountingUploader {
        uploaded: Mutex<Vec<String>>,
        fail_after: Option<usize>,
    }

    impl CountingUploader {
        fn new(fail_after: Option<usize>) -> Self {
            Self {
                uploaded: Mutex::new(Vec::new()),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl MediaUploader for CountingUploader {
        async fn upload(&self, _bytes: Vec<u8>, filename: &str) -> Result<String, MediaError> {
            let mut uploaded = self.uploaded.lock().await;
            if self.fail_after.map_or(false, |n| uploaded.len() >= n) {
                return Err(MediaError::Response("quota exceeded".into()));
            }
            uploaded.push(filename.to_owned());
            Ok(format!("https://cdn.example.com/{}", filename))
        }
    }

    fn attachment(name: &str) -> Attachment {
        Attachment {
            bytes: vec![0xff, 0xd8],
            filename: name.into(),
        }
    }

    #[tokio::test]
    async fn publish_uploads_in_order_then_persists() {
        let backend = Arc::new(InMemoryBackend::new());
        let uploader = Arc::new(CountingUploader::new(None));
        let publisher = Publisher::new(backend.clone(), uploader.clone());
        let author = Uuid::new_v4();

        let post = publisher
            .publish(author, "two shots", vec![attachment("a.jpg"), attachment("b.jpg")])
            .await
            .unwrap();

        assert_eq!(
            post.media_urls.as_slice(),
            ["https://cdn.example.com/a.jpg", "https://cdn.example.com/b.jpg"]
        );
        assert_eq!(*uploader.uploaded.lock().await, vec!["a.jpg", "b.jpg"]);
        assert_eq!(PostRepository::find(&*backend, post.id).await.unwrap().content, "two shots");
    }

    #[tokio::test]
    async fn failed_upload_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let publisher = Publisher::new(backend.clone(), Arc::new(CountingUploader::new(Some(1))));
        let author = Uuid::new_v4();

        let res = publisher
            .publish(author, "", vec![attachment("ok.jpg"), attachment("too-many.jpg")])
            .await;
        assert!(matches!(res, Err(PostError::Media(_))));
        assert!(backend.find_by_authors(&[author]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_draft_is_rejected_locally() {
        let backend = Arc::new(InMemoryBackend::new());
        let publisher = Publisher::new(backend.clone(), Arc::new(CountingUploader::new(None)));

        let res = publisher.publish(Uuid::new_v4(), "   ", Vec::new()).await;
        assert!(matches!(res, Err(PostError::Empty)));
    }

    #[tokio::test]
    async fn text_only_post_needs_no_uploads() {
        let backend = Arc::new(InMemoryBackend::new());
        let uploader = Arc::new(CountingUploader::new(Some(0)));
        let publisher = Publisher::new(backend.clone(), uploader);

        let post = publisher
            .publish(Uuid::new_v4(), "words only", Vec::new())
            .await
            .unwrap();
        assert!(post.media_urls.is_empty());
    }

    #[tokio::test]
    async fn edit_replaces_text_and_bumps_updated_at() {
        let backend = Arc::new(InMemoryBackend::new());
        let publisher = Publisher::new(backend.clone(), Arc::new(CountingUploader::new(None)));

        let post = publisher
            .publish(Uuid::new_v4(), "first draft", Vec::new())
            .await
            .unwrap();
        let edited = publisher.edit_content(post.id, "second draft").await.unwrap();

        assert_eq!(edited.content, "second draft");
        assert!(edited.updated_at >= post.updated_at);
        assert_eq!(edited.created_at, post.created_at);
    }
}
