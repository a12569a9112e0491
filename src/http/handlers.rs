//! Security management API.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::AppState;
use crate::config::{RateLimitPolicy, MAX_DURATION_SECS};
use crate::metrics::MetricsSnapshot;
use crate::security::{BanSource, BanView, EntryView, ReputationTarget, ViolationView};

/// Default number of top offenders returned by `GET /security/violations`.
const DEFAULT_TOP_OFFENDERS: usize = 10;

/// Errors returned by the management API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        };
        let body = json!({
            "code": code,
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes for `/security/*`.
pub fn security_routes() -> Router<AppState> {
    Router::new()
        .route("/security/status", get(status))
        .route("/security/violations", get(violations))
        .route("/security/metrics", get(metrics))
        .route("/security/blacklist", post(add_to_blacklist))
        .route("/security/blacklist/{ip}", delete(remove_from_blacklist))
        .route("/security/whitelist", post(add_to_whitelist))
        .route("/security/whitelist/{ip}", delete(remove_from_whitelist))
        .route("/security/ban", post(ban))
        .route("/security/ban/{ip}", delete(unban))
}

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub policy: RateLimitPolicy,
    pub whitelist: Vec<EntryView>,
    pub blacklist: Vec<EntryView>,
    pub bans: Vec<BanView>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let reputation = state.controller.reputation();
    Json(StatusResponse {
        policy: state.controller.policy().clone(),
        whitelist: reputation.whitelist_entries(),
        blacklist: reputation.blacklist_entries(),
        bans: reputation.ban_entries(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ViolationsResponse {
    pub tracked: usize,
    pub top_offenders: Vec<ViolationView>,
    pub violations: Vec<ViolationView>,
}

async fn violations(
    State(state): State<AppState>,
    Query(query): Query<ViolationsQuery>,
) -> Json<ViolationsResponse> {
    let tracker = state.controller.violations();
    let violations = tracker.snapshot();
    let top_offenders = tracker.top_offenders(query.limit.unwrap_or(DEFAULT_TOP_OFFENDERS));

    Json(ViolationsResponse {
        tracked: violations.len(),
        top_offenders,
        violations,
    })
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.controller.metrics())
}

#[derive(Debug, Deserialize)]
pub struct BlacklistRequest {
    pub ip: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Seconds; zero or absent is permanent
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    pub ip: String,
    /// Seconds; zero or absent is permanent
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub ip: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Seconds; zero or absent uses the configured ban duration
    #[serde(default)]
    pub duration: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub message: String,
    pub ip: String,
}

fn parse_target(raw: &str) -> ApiResult<ReputationTarget> {
    raw.parse().map_err(ApiError::InvalidRequest)
}

fn parse_ip(raw: &str) -> ApiResult<IpAddr> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("'{}' is not an IP address", raw)))
}

/// A request duration in seconds; zero or absent is `None`.
fn ttl(duration: Option<u64>) -> ApiResult<Option<Duration>> {
    match duration {
        Some(secs) if secs > MAX_DURATION_SECS => Err(ApiError::InvalidRequest(format!(
            "duration must be at most {} seconds",
            MAX_DURATION_SECS
        ))),
        Some(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Ok(None),
    }
}

fn created(message: &str, ip: String) -> (StatusCode, Json<MutationResponse>) {
    (
        StatusCode::CREATED,
        Json(MutationResponse {
            message: message.to_string(),
            ip,
        }),
    )
}

fn removed(message: &str, ip: String) -> Json<MutationResponse> {
    Json(MutationResponse {
        message: message.to_string(),
        ip,
    })
}

async fn add_to_blacklist(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BlacklistRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let target = parse_target(&request.ip)?;
    let reason = request.reason.as_deref().unwrap_or("manual blacklist");
    let expires_in = ttl(request.duration)?;

    state
        .controller
        .reputation()
        .add_to_blacklist(target, reason, expires_in);
    Ok(created("IP added to blacklist", target.to_string()))
}

async fn remove_from_blacklist(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<MutationResponse>> {
    let target = parse_target(&ip)?;
    if !state.controller.reputation().remove_from_blacklist(&target) {
        return Err(ApiError::NotFound(format!("{} is not blacklisted", target)));
    }
    Ok(removed("IP removed from blacklist", target.to_string()))
}

async fn add_to_whitelist(
    State(state): State<AppState>,
    payload: std::result::Result<Json<WhitelistRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let target = parse_target(&request.ip)?;
    let expires_in = ttl(request.duration)?;

    state
        .controller
        .reputation()
        .add_to_whitelist(target, expires_in);
    Ok(created("IP added to whitelist", target.to_string()))
}

async fn remove_from_whitelist(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<MutationResponse>> {
    let target = parse_target(&ip)?;
    if !state.controller.reputation().remove_from_whitelist(&target) {
        return Err(ApiError::NotFound(format!("{} is not whitelisted", target)));
    }
    Ok(removed("IP removed from whitelist", target.to_string()))
}

async fn ban(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BanRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let ip = parse_ip(&request.ip)?;
    let reason = request.reason.as_deref().unwrap_or("manual ban");
    let duration = ttl(request.duration)?
        .unwrap_or_else(|| state.controller.policy().auto_ban.ban_duration());

    state
        .controller
        .reputation()
        .ban(ip, reason, duration, BanSource::Manual);
    info!(ip = %ip, reason = %reason, duration_secs = duration.as_secs(), "Manual ban issued");
    Ok(created("IP banned", ip.to_string()))
}

async fn unban(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<MutationResponse>> {
    let ip = parse_ip(&ip)?;
    if !state.controller.reputation().unban(&ip) {
        return Err(ApiError::NotFound(format!("{} is not banned", ip)));
    }
    Ok(removed("IP unbanned", ip.to_string()))
}
