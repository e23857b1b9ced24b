use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use super::handlers::{
    browser_switch, harvest_page, harvest_script, health_check, redirect_url, RedirectState,
};
use super::middleware::record_request_start;

pub fn create_redirect_router(state: Arc<RedirectState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/{code}", get(redirect_url))
        .route("/i/{scheme}/{app_uuid}", get(browser_switch))
        .route("/m/{scheme}/{context}/{short_code}/", get(harvest_page))
        .route(
            "/m/{scheme}/{context}/{short_code}/deeplink.js",
            get(harvest_script),
        )
        .layer(middleware::from_fn(record_request_start))
        .with_state(state)
}
