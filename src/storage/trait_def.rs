use crate::models::{AppOpen, FingerprintedVisit, Install, Link, ShortUrl};
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to encode or decode stored document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Keyed storage the attribution core depends on.
///
/// Implementations must make each single-key write atomic (last write wins); nothing
/// here relies on consistency across keys. "Not found" is always `Ok(None)`, never an error.
#[async_trait]
pub trait AttributionStore: Send + Sync {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;

    async fn find_short_url(&self, code: &str) -> StorageResult<Option<ShortUrl>>;

    /// Insert or replace a short url document
    async fn save_short_url(&self, url: &ShortUrl) -> StorageResult<()>;

    /// Raw install record; callers decide whether it has expired
    async fn find_install(&self, scheme: &str, context: &str) -> StorageResult<Option<Install>>;

    async fn track_install(&self, install: &Install) -> StorageResult<()>;

    async fn find_app_open(&self, scheme: &str, context: &str)
        -> StorageResult<Option<AppOpen>>;

    /// Overwrite the app open stored under `(app_open.app_url_scheme, app_open.context)`
    async fn track_app_open(&self, app_open: &AppOpen) -> StorageResult<()>;

    /// Look up the link between two contexts in either order
    async fn find_link(&self, a: &str, b: &str) -> StorageResult<Option<Link>>;

    /// Record a link. Returns false when the pair was already linked.
    async fn link(&self, link: &Link) -> StorageResult<bool>;

    async fn save_fingerprinted_visit(&self, visit: &FingerprintedVisit) -> StorageResult<()>;

    /// Visits recorded at or after `since`, newest first
    async fn recent_fingerprinted_visits(
        &self,
        since: i64,
        limit: usize,
    ) -> StorageResult<Vec<FingerprintedVisit>>;

    /// Delete visits recorded before `before`. Returns how many were removed.
    async fn prune_fingerprinted_visits(&self, before: i64) -> StorageResult<u64>;
}
