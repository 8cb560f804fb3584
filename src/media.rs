//! Media upload. Images go to an unsigned Cloudinary upload endpoint
//! before the owning record is persisted, so a failed upload never
//! leaves a record pointing at a URL that does not exist.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("upload failed: {0}")]
    Upload(#[from] reqwest::Error),
    #[error("unexpected upload response: {0}")]
    Response(String),
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Uploads raw image bytes and returns the hosted URL.
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String, MediaError>;
}

pub struct CloudinaryUploader {
    http: reqwest::Client,
    endpoint: String,
    upload_preset: String,
}

impl CloudinaryUploader {
    pub fn new(cloud_name: &str, upload_preset: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!(
                "https://api.cloudinary.com/v1_1/{}/image/upload",
                cloud_name
            ),
            upload_preset: upload_preset.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for CloudinaryUploader {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String, MediaError> {
        let form = Form::new()
            .text("upload_preset", self.upload_preset.clone())
            .part("file", Part::bytes(bytes).file_name(filename.to_owned()));

        let res = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = res.json().await?;
        body.get("secure_url")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| MediaError::Response(body.to_string()))
    }
}
