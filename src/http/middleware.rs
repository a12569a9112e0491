//! Axum middleware that runs every request through the admission controller.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::warn;

use super::AppState;
use crate::admission::Quota;
use crate::error::{AdmissionError, BlockReason};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Admit or reject a request before it reaches any handler.
///
/// Admitted requests get `X-RateLimit-Limit` / `X-RateLimit-Remaining`
/// headers for the most restrictive bucket consulted; whitelisted requests
/// pass through untouched.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request, state.trust_forwarded_headers);
    let decision = state
        .controller
        .check(ip, request.method().as_str(), request.uri().path());

    match decision {
        Ok(admission) => {
            let mut response = next.run(request).await;
            if let Some(quota) = admission.quota {
                set_quota_headers(response.headers_mut(), quota);
            }
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}

fn set_quota_headers(headers: &mut HeaderMap, quota: Quota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
}

/// Resolve the client IP: forwarded headers when trusted, then the socket
/// peer address. Falls back to the unspecified address rather than failing.
pub fn client_ip(request: &Request, trust_forwarded_headers: bool) -> IpAddr {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return ip;
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip(),
        None => {
            warn!("No peer address on request; treating client as unspecified");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    forwarded_for.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        match &self {
            AdmissionError::RateLimited {
                limit, retry_after, ..
            } => {
                let retry_after = retry_after.as_secs();
                let body = json!({
                    "code": self.code(),
                    "error": "Too many requests, please slow down and retry later",
                    "retry_after": retry_after,
                });

                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(*limit));
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
                response
            }
            AdmissionError::IpBlocked { reason, .. } => {
                let message = match reason {
                    BlockReason::Blacklisted(_) => "Access denied: this IP address is blacklisted",
                    BlockReason::Banned(_) => "Access denied: this IP address is temporarily banned",
                };
                let body = json!({
                    "code": self.code(),
                    "error": message,
                });
                (StatusCode::FORBIDDEN, Json(body)).into_response()
            }
        }
    }
}
