use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::attribution::{LaunchReport, LinkingEngine};
use crate::matching::FingerprintMatcher;
use crate::models::AttributionPath;
use crate::visitor::VisitorInspector;

pub struct AppState {
    pub linking: Arc<LinkingEngine>,
    pub fingerprints: Arc<FingerprintMatcher>,
    pub inspector: VisitorInspector,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TryResponse {
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deeplink: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
}

/// Empty bodies are an empty report; anything else must be a JSON object.
fn parse_report(body: &Bytes) -> Result<LaunchReport, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(LaunchReport::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid launch report: {err}"),
            }),
        )
    })
}

/// Deferred attribution attempt for a fresh install with no referral information
pub async fn try_fingerprint(
    State(state): State<Arc<AppState>>,
    Path((scheme, app_uuid)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TryResponse>), ApiError> {
    let now = chrono::Utc::now().timestamp();
    let fingerprint = state.inspector.fingerprint(&headers, addr.ip());

    let result = state
        .fingerprints
        .match_fingerprint(&fingerprint, &scheme, now)
        .await
        .map_err(|err| {
            error!(scheme = %scheme, error = %err, "fingerprint lookup failed");
            internal_error()
        })?;

    let Some(visit) = result.visit else {
        info!(scheme = %scheme, score = result.score, "no fingerprint match");
        return Ok((
            StatusCode::NOT_ACCEPTABLE,
            Json(TryResponse {
                score: result.score,
                source_context: None,
                short_code: None,
                deeplink: None,
            }),
        ));
    };

    let app_open = LaunchReport::from_visit(&visit).into_app_open(&scheme, &app_uuid, now);
    state
        .linking
        .attribute_launch(&app_open, AttributionPath::Fingerprint)
        .await
        .map_err(|err| {
            error!(scheme = %scheme, error = %err, "failed to record fingerprint install");
            internal_error()
        })?;

    info!(scheme = %scheme, short_code = %visit.short_code, score = result.score, "fingerprint matched");
    Ok((
        StatusCode::OK,
        Json(TryResponse {
            score: result.score,
            source_context: Some(visit.context),
            short_code: Some(visit.short_code),
            deeplink: visit.deeplink,
        }),
    ))
}

/// Install reported by an app that was launched with referral information
pub async fn report_install(
    State(state): State<Arc<AppState>>,
    Path((scheme, app_uuid)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let report = parse_report(&body)?;
    let app_open = report.into_app_open(&scheme, &app_uuid, chrono::Utc::now().timestamp());

    state
        .linking
        .attribute_launch(&app_open, AttributionPath::Referred)
        .await
        .map_err(|err| {
            error!(scheme = %scheme, error = %err, "failed to record install");
            internal_error()
        })?;

    Ok(Json(SuccessResponse {
        message: "Install recorded".to_string(),
    }))
}

/// App opened through a deep link
pub async fn report_open_url(
    State(state): State<Arc<AppState>>,
    Path((scheme, app_uuid)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let report = parse_report(&body)?;
    let app_open = report.into_app_open(&scheme, &app_uuid, chrono::Utc::now().timestamp());

    state
        .linking
        .handle_app_open(&app_open, AttributionPath::Deeplink)
        .await
        .map_err(|err| {
            error!(scheme = %scheme, error = %err, "failed to record app open");
            internal_error()
        })?;

    Ok(Json(SuccessResponse {
        message: "App open recorded".to_string(),
    }))
}
