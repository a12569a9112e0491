//! Bucket key generation and handling.

use std::net::IpAddr;
use std::sync::Arc;

/// A key that uniquely identifies a token bucket in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// The single bucket shared by every request
    Global,
    /// One bucket per client IP
    PerIp(IpAddr),
    /// One bucket per client IP and endpoint override
    Endpoint {
        method: Arc<str>,
        pattern: Arc<str>,
        ip: IpAddr,
    },
}

impl BucketKey {
    pub fn endpoint(method: Arc<str>, pattern: Arc<str>, ip: IpAddr) -> Self {
        BucketKey::Endpoint {
            method,
            pattern,
            ip,
        }
    }

    /// Whether the sweeper may evict this bucket when idle.
    pub fn is_evictable(&self) -> bool {
        !matches!(self, BucketKey::Global)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketKey::Global => write!(f, "global"),
            BucketKey::PerIp(ip) => write!(f, "ip:{}", ip),
            BucketKey::Endpoint {
                method,
                pattern,
                ip,
            } => write!(f, "endpoint:{} {}:{}", method, pattern, ip),
        }
    }
}
