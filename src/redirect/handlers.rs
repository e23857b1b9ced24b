use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::content::ContentSource;
use super::cookies::{CookieWriter, RequestCookies};
use super::interstitial::InterstitialRenderer;
use super::middleware::RequestStart;
use crate::attribution::{
    Action, LaunchReport, LinkingEngine, RedirectKind, RedirectResolver, Resolution,
};
use crate::events::spawn_detached;
use crate::models::AttributionPath;
use crate::visitor::VisitorInspector;

pub const COOKIED_HEADER: &str = "x-tether-context-cookied";
pub const TIMING_HEADER: &str = "x-tether-timing-total-ms";

pub struct RedirectState {
    pub resolver: Arc<RedirectResolver>,
    pub linking: Arc<LinkingEngine>,
    pub inspector: VisitorInspector,
    pub content: Arc<dyn ContentSource>,
    pub renderer: Arc<InterstitialRenderer>,
    pub cookies: CookieWriter,
    pub not_found_template: Option<String>,
    pub background_timeout: Duration,
}

/// Resolve a short code and redirect, or render the rule's content inline
pub async fn redirect_url(
    State(state): State<Arc<RedirectState>>,
    Path(code): Path<String>,
    Extension(RequestStart(request_start)): Extension<RequestStart>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let request_cookies = RequestCookies::from_headers(&headers);
    let visitor = state.inspector.attributes(&headers);

    let resolution = match state
        .resolver
        .resolve(&code, visitor.clone(), request_cookies.state_for(&code), now)
        .await
    {
        Ok(Some(resolution)) => resolution,
        Ok(None) => return not_found(state.not_found_template.as_deref(), &headers, &uri),
        Err(err) => {
            error!(short_code = %code, error = %err, "failed to resolve short code");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    state.cookies.set_visit(
        &mut response_headers,
        &resolution.context,
        &code,
        resolution.visit_count,
    );
    response_headers.insert(
        COOKIED_HEADER,
        HeaderValue::from_static(if resolution.cookied { "true" } else { "false" }),
    );

    let response = match &resolution.action {
        Action::Redirect { location, kind } => {
            let status = match kind {
                RedirectKind::Permanent => StatusCode::PERMANENT_REDIRECT,
                RedirectKind::Temporary => StatusCode::TEMPORARY_REDIRECT,
            };
            redirect_to(status, location, response_headers, request_start)
        }
        Action::RenderInline {
            source_url,
            fallback,
        } => match state.content.fetch(source_url).await {
            Ok(content) => {
                let content_type = content
                    .content_type
                    .as_deref()
                    .and_then(|ct| HeaderValue::from_str(ct).ok())
                    .unwrap_or_else(|| HeaderValue::from_static("text/html; charset=utf-8"));
                response_headers.insert(header::CONTENT_TYPE, content_type);
                response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
                insert_timing(&mut response_headers, request_start);
                (StatusCode::OK, response_headers, content.body).into_response()
            }
            Err(err) => {
                warn!(short_code = %code, source = %source_url, error = %err, "inline content fetch failed, redirecting");
                redirect_to(
                    StatusCode::TEMPORARY_REDIRECT,
                    fallback,
                    response_headers,
                    request_start,
                )
            }
        },
    };

    record_visit_in_background(&state, resolution, &headers, addr, visitor, now);
    response
}

fn record_visit_in_background(
    state: &RedirectState,
    resolution: Resolution,
    headers: &HeaderMap,
    addr: SocketAddr,
    visitor: crate::visitor::VisitorAttributes,
    now: i64,
) {
    let fingerprint = state.inspector.fingerprint(headers, addr.ip());
    let resolver = Arc::clone(&state.resolver);
    spawn_detached("record_visit", state.background_timeout, async move {
        resolver
            .record_visit(&resolution, fingerprint, &visitor, now)
            .await?;
        Ok(())
    });
}

/// Browser-switch report: the app opened the browser to prove which click it came from
pub async fn browser_switch(
    State(state): State<Arc<RedirectState>>,
    Path((scheme, app_uuid)): Path<(String, String)>,
    Extension(RequestStart(request_start)): Extension<RequestStart>,
    headers: HeaderMap,
) -> Response {
    let cookies = RequestCookies::from_headers(&headers);
    let Some(last) = cookies.last_code() else {
        debug!(scheme = %scheme, "browser switch without a previous short link visit");
        return redirect_to(
            StatusCode::TEMPORARY_REDIRECT,
            &format!("{scheme}://404"),
            HeaderMap::new(),
            request_start,
        );
    };

    if let Some(source) = cookies.context() {
        let report = LaunchReport {
            source_context: Some(source.to_string()),
            short_code: Some(last.to_string()),
            ..Default::default()
        };
        let app_open = report.into_app_open(&scheme, &app_uuid, chrono::Utc::now().timestamp());
        if let Err(err) = state
            .linking
            .attribute_launch(&app_open, AttributionPath::BrowserSwitch)
            .await
        {
            error!(scheme = %scheme, error = %err, "failed to record browser switch");
        }
    }

    redirect_to(
        StatusCode::TEMPORARY_REDIRECT,
        &format!("/{}", urlencoding::encode(last)),
        HeaderMap::new(),
        request_start,
    )
}

#[derive(Debug, Deserialize)]
pub struct HarvestQuery {
    f: Option<String>,
}

/// Harvest page for sandboxed webviews
pub async fn harvest_page(
    State(state): State<Arc<RedirectState>>,
    Path((scheme, context, short_code)): Path<(String, String, String)>,
    Query(query): Query<HarvestQuery>,
    headers: HeaderMap,
) -> Response {
    let visitor = state.inspector.attributes(&headers);
    let now = chrono::Utc::now().timestamp();
    let harvest = match state
        .resolver
        .harvest(&short_code, &scheme, &context, visitor, now)
        .await
    {
        Ok(Some(harvest)) => harvest,
        Ok(None) => return (StatusCode::NOT_FOUND, "URL not found").into_response(),
        Err(err) => {
            error!(short_code = %short_code, error = %err, "failed to load harvest page");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    let fallback = web_url(query.f.as_deref()).unwrap_or(harvest.fallback);

    let mut response_headers = HeaderMap::new();
    match RequestCookies::from_headers(&headers).context() {
        Some(browser_context) if browser_context != context => {
            let linking = Arc::clone(&state.linking);
            let browser_context = browser_context.to_string();
            spawn_detached("bridge_contexts", state.background_timeout, async move {
                linking
                    .bridge_contexts(&scheme, &context, &browser_context, &short_code, now)
                    .await?;
                Ok(())
            });
        }
        Some(_) => {}
        // The webview's context becomes this browser's context
        None => state.cookies.set_context(&mut response_headers, &context),
    }

    match state.renderer.page(&harvest.deeplink, &fallback) {
        Ok(html) => (response_headers, Html(html)).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render harvest page");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Companion script of the harvest page
pub async fn harvest_script(
    State(state): State<Arc<RedirectState>>,
    Path((scheme, context, short_code)): Path<(String, String, String)>,
    Query(query): Query<HarvestQuery>,
    headers: HeaderMap,
) -> Response {
    let visitor = state.inspector.attributes(&headers);
    let now = chrono::Utc::now().timestamp();
    let harvest = match state
        .resolver
        .harvest(&short_code, &scheme, &context, visitor, now)
        .await
    {
        Ok(Some(harvest)) => harvest,
        Ok(None) => return (StatusCode::NOT_FOUND, "URL not found").into_response(),
        Err(err) => {
            error!(short_code = %short_code, error = %err, "failed to load harvest script");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    let fallback = web_url(query.f.as_deref()).unwrap_or(harvest.fallback);

    match state.renderer.script(&harvest.deeplink, &fallback) {
        Ok(js) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            )],
            js,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to render harvest script");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Only absolute http(s) fallbacks are honored, so the page cannot be used as an open
/// redirect to other schemes.
fn web_url(candidate: Option<&str>) -> Option<String> {
    let parsed = url::Url::parse(candidate?).ok()?;
    matches!(parsed.scheme(), "http" | "https").then(|| parsed.to_string())
}

fn not_found(template: Option<&str>, headers: &HeaderMap, uri: &Uri) -> Response {
    let Some(template) = template else {
        return (StatusCode::NOT_FOUND, "URL not found").into_response();
    };
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http");
    let requested = format!("{proto}://{host}{uri}");
    let location = template.replace("{url}", &urlencoding::encode(&requested));
    redirect_to(
        StatusCode::TEMPORARY_REDIRECT,
        &location,
        HeaderMap::new(),
        Instant::now(),
    )
}

fn insert_timing(headers: &mut HeaderMap, request_start: Instant) {
    headers.insert(
        TIMING_HEADER,
        HeaderValue::from(request_start.elapsed().as_millis() as u64),
    );
}

fn redirect_to(
    status: StatusCode,
    location: &str,
    mut headers: HeaderMap,
    request_start: Instant,
) -> Response {
    let Ok(location_value) = HeaderValue::from_str(location) else {
        error!(location, "destination is not a valid Location header");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid destination").into_response();
    };
    headers.insert(header::LOCATION, location_value);
    insert_timing(&mut headers, request_start);
    (status, headers).into_response()
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
