//! Admission counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on every admission decision.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    requests_total: AtomicU64,
    admitted: AtomicU64,
    whitelisted: AtomicU64,
    rate_limited: AtomicU64,
    blocked: AtomicU64,
    auto_bans: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_whitelisted(&self) {
        self.whitelisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_ban(&self) {
        self.auto_bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> MetricsCounters {
        MetricsCounters {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            whitelisted: self.whitelisted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            auto_bans: self.auto_bans.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsCounters {
    pub requests_total: u64,
    /// Admitted after passing every bucket (whitelisted requests excluded)
    pub admitted: u64,
    pub whitelisted: u64,
    pub rate_limited: u64,
    pub blocked: u64,
    pub auto_bans: u64,
}

/// Sizes of the admission layer's tracked state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateGauges {
    pub active_buckets: usize,
    pub active_bans: usize,
    pub blacklist_entries: usize,
    pub whitelist_entries: usize,
    pub tracked_violators: usize,
}

/// Body of `GET /security/metrics`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: MetricsCounters,
    #[serde(flatten)]
    pub gauges: StateGauges,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = AdmissionMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_admitted();
        metrics.record_rate_limited();
        metrics.record_auto_ban();

        let counters = metrics.counters();
        assert_eq!(counters.requests_total, 2);
        assert_eq!(counters.admitted, 1);
        assert_eq!(counters.rate_limited, 1);
        assert_eq!(counters.blocked, 0);
        assert_eq!(counters.auto_bans, 1);
    }

    #[test]
    fn test_snapshot_is_flat() {
        let snapshot = MetricsSnapshot {
            counters: MetricsCounters {
                admitted: 3,
                ..Default::default()
            },
            gauges: StateGauges {
                active_bans: 2,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["admitted"], 3);
        assert_eq!(json["active_bans"], 2);
    }
}
