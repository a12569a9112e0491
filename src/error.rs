//! Error types for the Gatekeeper service.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper startup and server operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid configuration values (fatal at startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while reading configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Which bucket in the admission chain rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    PerIp,
    Endpoint,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Global => "global",
            LimitScope::PerIp => "per_ip",
            LimitScope::Endpoint => "endpoint",
        }
    }
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a blocked IP was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Blacklisted(String),
    Banned(String),
}

/// A request refused by the admission layer.
///
/// These are policy outcomes, not faults: the process keeps serving and the
/// client is expected to back off (`RateLimited`) or stay away (`IpBlocked`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("Rate limit exceeded ({scope}), retry in {} seconds", retry_after.as_secs())]
    RateLimited {
        ip: IpAddr,
        scope: LimitScope,
        limit: u64,
        retry_after: Duration,
        /// Set when this violation promoted the IP to a ban.
        banned: bool,
    },

    #[error("Access from {ip} is blocked")]
    IpBlocked { ip: IpAddr, reason: BlockReason },
}

impl AdmissionError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "RATE_LIMITED",
            AdmissionError::IpBlocked { .. } => "IP_BLOCKED",
        }
    }
}
