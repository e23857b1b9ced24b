//! Service wiring shared by the server binary and integration tests.

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::{self, handlers::AppState};
use crate::attribution::{LinkingEngine, RedirectResolver};
use crate::config::{Config, DatabaseBackend};
use crate::events::{EventPublisher, EventSink};
use crate::matching::{spawn_visit_pruning, FingerprintMatcher, RuleMatcher};
use crate::redirect::{
    self, ContentSource, CookieWriter, HttpContentSource, InterstitialRenderer, RedirectState,
};
use crate::storage::{AttributionStore, CachedStore, MemoryStore, SqliteStore};
use crate::visitor::{GeoIpService, VisitorInspector};

/// Both routers plus the handle needed to drain events on shutdown.
pub struct Tether {
    pub api_router: Router,
    pub redirect_router: Router,
    pub publisher: EventPublisher,
    pub store: Arc<dyn AttributionStore>,
}

/// Open and initialize the configured store behind the short url cache.
pub async fn open_store(config: &Config) -> Result<Arc<dyn AttributionStore>> {
    let inner: Arc<dyn AttributionStore> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Arc::new(SqliteStore::new(&config.database.url, config.database.max_connections).await?)
        }
        DatabaseBackend::Memory => {
            info!("Using in-memory storage; attribution state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    inner.init().await.context("Failed to initialize storage")?;

    Ok(Arc::new(CachedStore::new(
        inner,
        config.cache.max_entries,
        config.cache.ttl_secs,
    )))
}

pub fn default_content_source(config: &Config) -> Result<Arc<dyn ContentSource>> {
    let source = HttpContentSource::new(Duration::from_millis(
        config.attribution.content_fetch_timeout_ms,
    ))
    .context("Failed to build content source client")?;
    Ok(Arc::new(source))
}

/// Assemble every service from explicit dependencies. Must run inside a Tokio runtime.
pub fn build(
    config: &Config,
    store: Arc<dyn AttributionStore>,
    sink: Arc<dyn EventSink>,
    content: Arc<dyn ContentSource>,
) -> Result<Tether> {
    let attribution = &config.attribution;

    let geoip = GeoIpService::new(
        config.visitor.geoip_city_db_path.as_deref(),
        config.visitor.geoip_asn_db_path.as_deref(),
    )?;
    if geoip.is_enabled() {
        info!("GeoIP lookups enabled");
    }
    let inspector = VisitorInspector::new(geoip, config.visitor.clone());

    let publisher = EventPublisher::spawn(
        sink,
        config.events.buffer_size,
        Duration::from_millis(config.events.publish_timeout_ms),
    );
    let linking = Arc::new(LinkingEngine::new(
        Arc::clone(&store),
        publisher.clone(),
        attribution.default_install_ttl_secs,
    ));
    let resolver = Arc::new(RedirectResolver::new(
        Arc::clone(&store),
        Arc::clone(&linking),
        publisher.clone(),
        RuleMatcher::new(attribution.special_fallback),
    ));
    let fingerprints = Arc::new(FingerprintMatcher::new(
        Arc::clone(&store),
        attribution.min_matching_score,
        attribution.fingerprint_expiration_minutes,
        attribution.fingerprint_candidate_limit,
    ));
    if attribution.visit_prune_interval_secs > 0 {
        spawn_visit_pruning(
            Arc::clone(&fingerprints),
            Duration::from_secs(attribution.visit_prune_interval_secs),
        );
    }

    let redirect_state = Arc::new(RedirectState {
        resolver,
        linking: Arc::clone(&linking),
        inspector: inspector.clone(),
        content,
        renderer: Arc::new(InterstitialRenderer::new(attribution.interstitial_timeout_ms)?),
        cookies: CookieWriter::new(&config.cookies),
        not_found_template: attribution.not_found_template.clone(),
        background_timeout: Duration::from_millis(attribution.background_timeout_ms),
    });
    let api_state = Arc::new(AppState {
        linking,
        fingerprints,
        inspector,
    });

    Ok(Tether {
        api_router: api::create_api_router(api_state),
        redirect_router: redirect::create_redirect_router(redirect_state),
        publisher,
        store,
    })
}
