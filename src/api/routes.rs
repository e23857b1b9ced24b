use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use super::handlers::{report_install, report_open_url, try_fingerprint, AppState};
use crate::redirect::handlers::health_check;

pub fn create_api_router(state: Arc<AppState>) -> Router {
    // App SDKs and webviews call these from arbitrary origins
    let events = Router::new()
        .route("/try/{scheme}/{app_uuid}", post(try_fingerprint))
        .route("/install/{scheme}/{app_uuid}", post(report_install))
        .route("/openurl/{scheme}/{app_uuid}", post(report_open_url))
        .layer(CorsLayer::permissive())
        .with_state(state);

    Router::new()
        .route("/", get(health_check))
        .nest("/api/v1/events", events)
}
