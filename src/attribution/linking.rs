//! Context association, install and app-open tracking.
//!
//! Fingerprint matches, browser-switch reports and referred launches all end up in
//! [`LinkingEngine::handle_install`] and [`LinkingEngine::handle_app_open`].

use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::EventPublisher;
use crate::models::{
    AppOpen, AttributionEvent, AttributionPath, Campaign, Install, LaunchEvent, Link, LinkEvent,
};
use crate::storage::{AttributionStore, StorageResult};

pub struct LinkingEngine {
    store: Arc<dyn AttributionStore>,
    publisher: EventPublisher,
    default_install_ttl_secs: i64,
}

/// An app open is fresh while it is younger than the rule's TTL. A zero TTL is never fresh.
pub fn is_fresh(app_open: Option<&AppOpen>, ttl_secs: i64, now: i64) -> bool {
    app_open.is_some_and(|open| now - open.timestamp < ttl_secs)
}

impl LinkingEngine {
    pub fn new(
        store: Arc<dyn AttributionStore>,
        publisher: EventPublisher,
        default_install_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            publisher,
            default_install_ttl_secs,
        }
    }

    pub async fn track_install(
        &self,
        scheme: &str,
        context: &str,
        ttl_secs: i64,
        now: i64,
    ) -> StorageResult<()> {
        self.store
            .track_install(&Install {
                app_url_scheme: scheme.to_string(),
                context: context.to_string(),
                installed_at: now,
                expires_at: now + ttl_secs,
            })
            .await
    }

    /// Live install marker for the pair; expired markers read as absent.
    pub async fn find_install(
        &self,
        scheme: &str,
        context: &str,
        now: i64,
    ) -> StorageResult<Option<Install>> {
        Ok(self
            .store
            .find_install(scheme, context)
            .await?
            .filter(|install| install.is_live(now)))
    }

    /// Store the open under the app's context and, when it differs, the source context.
    pub async fn track_app_open(&self, app_open: &AppOpen) -> StorageResult<()> {
        self.store
            .track_app_open(&app_open.keyed_to(&app_open.app_context))
            .await?;
        if let Some(source) = distinct_source(app_open) {
            self.store.track_app_open(&app_open.keyed_to(source)).await?;
        }
        Ok(())
    }

    pub async fn find_app_open(&self, scheme: &str, context: &str) -> StorageResult<Option<AppOpen>> {
        self.store.find_app_open(scheme, context).await
    }

    /// Returns true when the pair was not linked before.
    pub async fn link(
        &self,
        a: &str,
        b: &str,
        scheme: &str,
        short_code: Option<&str>,
        now: i64,
    ) -> StorageResult<bool> {
        let link = Link::new(a, b, scheme, short_code, now);
        let created = self.store.link(&link).await?;
        if created {
            self.publisher.publish(AttributionEvent::Link(LinkEvent {
                context1: link.context1,
                context2: link.context2,
                app_url_scheme: link.app_url_scheme,
                short_code: link.short_code,
                timestamp: now,
            }));
        }
        Ok(created)
    }

    pub async fn find_link(&self, a: &str, b: &str) -> StorageResult<Option<Link>> {
        self.store.find_link(a, b).await
    }

    /// First launch of an app attributed to a click.
    pub async fn handle_install(&self, app_open: &AppOpen, path: AttributionPath) -> StorageResult<()> {
        let now = app_open.timestamp;
        self.link_source(app_open, now).await?;

        let (campaign, install_ttl) = self.enrichment(app_open.short_code.as_deref()).await;
        self.track_install(
            &app_open.app_url_scheme,
            &app_open.app_context,
            install_ttl.unwrap_or(self.default_install_ttl_secs),
            now,
        )
        .await?;

        self.publisher
            .publish(AttributionEvent::Install(launch_event(app_open, path, campaign)));
        Ok(())
    }

    pub async fn handle_app_open(&self, app_open: &AppOpen, path: AttributionPath) -> StorageResult<()> {
        self.link_source(app_open, app_open.timestamp).await?;
        self.track_app_open(app_open).await?;

        let (campaign, _) = self.enrichment(app_open.short_code.as_deref()).await;
        self.publisher
            .publish(AttributionEvent::AppOpen(launch_event(app_open, path, campaign)));
        Ok(())
    }

    /// Install followed by app open, the common tail of every launch report.
    pub async fn attribute_launch(&self, app_open: &AppOpen, path: AttributionPath) -> StorageResult<()> {
        self.handle_install(app_open, path).await?;
        self.handle_app_open(app_open, path).await
    }

    /// Join the context embedded in a harvest URL with the browser's own context.
    pub async fn bridge_contexts(
        &self,
        scheme: &str,
        url_context: &str,
        browser_context: &str,
        short_code: &str,
        now: i64,
    ) -> StorageResult<()> {
        if url_context == browser_context {
            return Ok(());
        }

        self.link(url_context, browser_context, scheme, Some(short_code), now)
            .await?;

        if let Some(open) = self.store.find_app_open(scheme, url_context).await? {
            debug!(scheme, "carrying app open over to browser context");
            self.store
                .track_app_open(&open.keyed_to(browser_context))
                .await?;
        }
        Ok(())
    }

    async fn link_source(&self, app_open: &AppOpen, now: i64) -> StorageResult<bool> {
        match distinct_source(app_open) {
            Some(source) => {
                self.link(
                    source,
                    &app_open.app_context,
                    &app_open.app_url_scheme,
                    app_open.short_code.as_deref(),
                    now,
                )
                .await
            }
            None => Ok(false),
        }
    }

    /// Campaign fields and install TTL of the originating short url. Lookup problems
    /// degrade to an unknown origin.
    async fn enrichment(&self, short_code: Option<&str>) -> (Campaign, Option<i64>) {
        let Some(code) = short_code else {
            return (Campaign::default(), None);
        };
        match self.store.find_short_url(code).await {
            Ok(Some(url)) => {
                let ttl = (url.install_ttl_seconds > 0).then_some(url.install_ttl_seconds);
                (Campaign::from(&url), ttl)
            }
            Ok(None) => {
                warn!(short_code = %code, "unknown origin for launch report");
                (Campaign::default(), None)
            }
            Err(err) => {
                warn!(short_code = %code, error = %err, "failed to load short url for enrichment");
                (Campaign::default(), None)
            }
        }
    }
}

fn distinct_source(app_open: &AppOpen) -> Option<&str> {
    app_open
        .source_context
        .as_deref()
        .filter(|source| !source.is_empty() && *source != app_open.app_context)
}

fn launch_event(app_open: &AppOpen, path: AttributionPath, campaign: Campaign) -> LaunchEvent {
    LaunchEvent {
        app_url_scheme: app_open.app_url_scheme.clone(),
        app_context: app_open.app_context.clone(),
        source_context: app_open.source_context.clone(),
        source_application: app_open.source_application.clone(),
        short_code: app_open.short_code.clone(),
        deeplink: app_open.deeplink.clone(),
        path,
        campaign,
        timestamp: app_open.timestamp,
    }
}
