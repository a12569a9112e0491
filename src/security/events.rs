//! Security events published for audit consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// An event produced by the admission layer.
///
/// Published on a broadcast channel; downstream analytics (brute-force or
/// anomaly detection, audit logging) subscribe without slowing the hot path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A request was rejected by a rate limit and counted as a violation.
    RateLimited {
        ip: IpAddr,
        scope: &'static str,
        method: String,
        path: String,
        violations: u32,
    },
    /// Repeated violations promoted an IP to a temporary ban.
    AutoBanned {
        ip: IpAddr,
        reason: String,
        expires_at: DateTime<Utc>,
    },
    /// A blacklisted or banned IP attempted a request.
    Blocked { ip: IpAddr, reason: String },
}

impl SecurityEvent {
    pub fn ip(&self) -> IpAddr {
        match self {
            SecurityEvent::RateLimited { ip, .. }
            | SecurityEvent::AutoBanned { ip, .. }
            | SecurityEvent::Blocked { ip, .. } => *ip,
        }
    }
}
