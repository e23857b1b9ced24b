use crate::models::{AppOpen, FingerprintedVisit, Install, Link, ShortUrl};
use crate::storage::{AttributionStore, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Fingerprinted visits older than this many entries are dropped
const DEFAULT_VISIT_CAPACITY: usize = 100_000;

type ContextKey = (String, String);

/// In-process store backed by concurrent maps.
///
/// Each map entry is updated atomically, which is all the attribution core asks for.
/// Nothing survives a restart.
pub struct MemoryStore {
    short_urls: DashMap<String, ShortUrl>,
    installs: DashMap<ContextKey, Install>,
    app_opens: DashMap<ContextKey, AppOpen>,
    links: DashMap<ContextKey, Link>,
    visits: RwLock<VecDeque<FingerprintedVisit>>,
    visit_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_visit_capacity(DEFAULT_VISIT_CAPACITY)
    }

    pub fn with_visit_capacity(visit_capacity: usize) -> Self {
        Self {
            short_urls: DashMap::new(),
            installs: DashMap::new(),
            app_opens: DashMap::new(),
            links: DashMap::new(),
            visits: RwLock::new(VecDeque::new()),
            visit_capacity: visit_capacity.max(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(scheme: &str, context: &str) -> ContextKey {
    (scheme.to_string(), context.to_string())
}

#[async_trait]
impl AttributionStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn find_short_url(&self, code: &str) -> StorageResult<Option<ShortUrl>> {
        Ok(self.short_urls.get(code).map(|entry| entry.value().clone()))
    }

    async fn save_short_url(&self, url: &ShortUrl) -> StorageResult<()> {
        self.short_urls.insert(url.id.clone(), url.clone());
        Ok(())
    }

    async fn find_install(&self, scheme: &str, context: &str) -> StorageResult<Option<Install>> {
        Ok(self
            .installs
            .get(&key(scheme, context))
            .map(|entry| entry.value().clone()))
    }

    async fn track_install(&self, install: &Install) -> StorageResult<()> {
        self.installs.insert(
            key(&install.app_url_scheme, &install.context),
            install.clone(),
        );
        Ok(())
    }

    async fn find_app_open(
        &self,
        scheme: &str,
        context: &str,
    ) -> StorageResult<Option<AppOpen>> {
        Ok(self
            .app_opens
            .get(&key(scheme, context))
            .map(|entry| entry.value().clone()))
    }

    async fn track_app_open(&self, app_open: &AppOpen) -> StorageResult<()> {
        self.app_opens.insert(
            key(&app_open.app_url_scheme, &app_open.context),
            app_open.clone(),
        );
        Ok(())
    }

    async fn find_link(&self, a: &str, b: &str) -> StorageResult<Option<Link>> {
        Ok(self
            .links
            .get(&Link::key(a, b))
            .map(|entry| entry.value().clone()))
    }

    async fn link(&self, link: &Link) -> StorageResult<bool> {
        match self.links.entry(Link::key(&link.context1, &link.context2)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(link.clone());
                Ok(true)
            }
        }
    }

    async fn save_fingerprinted_visit(&self, visit: &FingerprintedVisit) -> StorageResult<()> {
        let mut visits = self.visits.write().await;
        visits.push_front(visit.clone());
        visits.truncate(self.visit_capacity);
        Ok(())
    }

    async fn recent_fingerprinted_visits(
        &self,
        since: i64,
        limit: usize,
    ) -> StorageResult<Vec<FingerprintedVisit>> {
        let visits = self.visits.read().await;
        let mut recent: Vec<FingerprintedVisit> = visits
            .iter()
            .filter(|visit| visit.timestamp >= since)
            .cloned()
            .collect();
        // Insertion order is not timestamp order when callers backfill
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn prune_fingerprinted_visits(&self, before: i64) -> StorageResult<u64> {
        let mut visits = self.visits.write().await;
        let kept = visits.len();
        visits.retain(|visit| visit.timestamp >= before);
        Ok((kept - visits.len()) as u64)
    }
}
