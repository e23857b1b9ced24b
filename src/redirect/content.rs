//! Fetching of `content_source_url` bodies for inline rendering.

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("content source answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, ContentError>;
}

/// Fetches over HTTP with a bounded timeout.
pub struct HttpContentSource {
    client: reqwest::Client,
}

impl HttpContentSource {
    pub fn new(timeout: Duration) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, ContentError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ContentError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(FetchedContent { content_type, body })
    }
}
