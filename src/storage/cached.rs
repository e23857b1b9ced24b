use crate::models::{AppOpen, FingerprintedVisit, Install, Link, ShortUrl};
use crate::storage::{AttributionStore, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper that caches short url lookups.
///
/// Short urls are read on every redirect and change rarely, so they go through a Moka
/// cache (negative results included). Attribution state is read-modify-write and always
/// goes straight to the inner store.
pub struct CachedStore {
    inner: Arc<dyn AttributionStore>,
    short_urls: Cache<String, Option<ShortUrl>>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn AttributionStore>, max_entries: u64, ttl_secs: u64) -> Self {
        let short_urls = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { inner, short_urls }
    }
}

#[async_trait]
impl AttributionStore for CachedStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn find_short_url(&self, code: &str) -> StorageResult<Option<ShortUrl>> {
        if let Some(cached) = self.short_urls.get(code).await {
            return Ok(cached);
        }

        // Errors are not cached
        let result = self.inner.find_short_url(code).await?;
        self.short_urls
            .insert(code.to_string(), result.clone())
            .await;

        Ok(result)
    }

    async fn save_short_url(&self, url: &ShortUrl) -> StorageResult<()> {
        self.inner.save_short_url(url).await?;
        self.short_urls
            .insert(url.id.clone(), Some(url.clone()))
            .await;
        Ok(())
    }

    async fn find_install(&self, scheme: &str, context: &str) -> StorageResult<Option<Install>> {
        self.inner.find_install(scheme, context).await
    }

    async fn track_install(&self, install: &Install) -> StorageResult<()> {
        self.inner.track_install(install).await
    }

    async fn find_app_open(
        &self,
        scheme: &str,
        context: &str,
    ) -> StorageResult<Option<AppOpen>> {
        self.inner.find_app_open(scheme, context).await
    }

    async fn track_app_open(&self, app_open: &AppOpen) -> StorageResult<()> {
        self.inner.track_app_open(app_open).await
    }

    async fn find_link(&self, a: &str, b: &str) -> StorageResult<Option<Link>> {
        self.inner.find_link(a, b).await
    }

    async fn link(&self, link: &Link) -> StorageResult<bool> {
        self.inner.link(link).await
    }

    async fn save_fingerprinted_visit(&self, visit: &FingerprintedVisit) -> StorageResult<()> {
        self.inner.save_fingerprinted_visit(visit).await
    }

    async fn recent_fingerprinted_visits(
        &self,
        since: i64,
        limit: usize,
    ) -> StorageResult<Vec<FingerprintedVisit>> {
        self.inner.recent_fingerprinted_visits(since, limit).await
    }

    async fn prune_fingerprinted_visits(&self, before: i64) -> StorageResult<u64> {
        self.inner.prune_fingerprinted_visits(before).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_save_refreshes_cached_lookup() {
        let inner: Arc<dyn AttributionStore> = Arc::new(MemoryStore::new());
        let store = CachedStore::new(Arc::clone(&inner), 100, 300);

        // Prime a negative entry
        assert!(store.find_short_url("abc").await.unwrap().is_none());

        store
            .save_short_url(&ShortUrl::new("abc", "https://example.com"))
            .await
            .unwrap();

        let found = store.find_short_url("abc").await.unwrap().unwrap();
        assert_eq!(found.destination, "https://example.com");
    }

    #[tokio::test]
    async fn test_negative_lookup_is_cached() {
        let inner: Arc<dyn AttributionStore> = Arc::new(MemoryStore::new());
        let store = CachedStore::new(Arc::clone(&inner), 100, 300);

        assert!(store.find_short_url("late").await.unwrap().is_none());

        // Written behind the cache's back: stays invisible until the entry expires
        inner
            .save_short_url(&ShortUrl::new("late", "https://example.com"))
            .await
            .unwrap();
        assert!(store.find_short_url("late").await.unwrap().is_none());
    }
}
