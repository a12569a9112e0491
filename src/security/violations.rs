//! Sliding-window violation counting and auto-ban promotion.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::clock::Clock;
use crate::config::AutoBanConfig;

/// Rate-limit violations of one IP.
#[derive(Debug, Clone)]
pub struct ViolationRecord {
    /// Violations in the current window
    pub count: u32,
    pub window_start: Instant,
    /// Violations since this record was created
    pub total: u64,
    pub last_violation: Instant,
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    /// Count in the current window, before any promotion reset
    pub count: u32,
    pub total: u64,
    /// The threshold was reached and the IP should be banned
    pub promote: bool,
}

/// Operator-facing rendering of a violation record.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationView {
    pub ip: IpAddr,
    /// Violations in the current window, zero once it has lapsed
    pub count: u32,
    pub total: u64,
    pub window_start: DateTime<Utc>,
    pub last_violation: DateTime<Utc>,
}

/// Counts rate-limit rejections per IP and decides auto-ban promotion.
///
/// Each IP's record is updated under its own map entry lock, so the
/// increment and the promotion reset happen atomically per IP.
#[derive(Debug)]
pub struct ViolationTracker {
    records: DashMap<IpAddr, ViolationRecord>,
    policy: AutoBanConfig,
    clock: Arc<dyn Clock>,
}

impl ViolationTracker {
    pub fn new(policy: AutoBanConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            policy,
            clock,
        }
    }

    /// Record one violation for `ip`.
    ///
    /// A record whose window has lapsed restarts at one. When auto-ban is
    /// enabled and the in-window count reaches the threshold the outcome is
    /// marked for promotion and the count is reset, so the next single
    /// violation cannot immediately re-trigger.
    pub fn record_violation(&self, ip: IpAddr) -> ViolationOutcome {
        let now = self.clock.now();
        let window = self.policy.window();

        let mut record = self.records.entry(ip).or_insert_with(|| ViolationRecord {
            count: 0,
            window_start: now,
            total: 0,
            last_violation: now,
        });

        if now.saturating_duration_since(record.window_start) > window {
            record.count = 0;
            record.window_start = now;
        }

        record.count += 1;
        record.total += 1;
        record.last_violation = now;

        let count = record.count;
        let promote = self.policy.enabled && count >= self.policy.threshold;
        if promote {
            record.count = 0;
            record.window_start = now;
        }

        debug!(ip = %ip, count = count, total = record.total, promote = promote, "Recorded violation");

        ViolationOutcome {
            count,
            total: record.total,
            promote,
        }
    }

    /// Violations of `ip` inside the current window.
    pub fn count(&self, ip: &IpAddr) -> u32 {
        let now = self.clock.now();
        self.records
            .get(ip)
            .map(|r| self.live_count(&r, now))
            .unwrap_or(0)
    }

    fn live_count(&self, record: &ViolationRecord, now: Instant) -> u32 {
        if now.saturating_duration_since(record.window_start) > self.policy.window() {
            0
        } else {
            record.count
        }
    }

    /// Forget records whose window ended more than one window ago.
    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let horizon = self.policy.window().saturating_mul(2);
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.window_start) <= horizon);
        before.saturating_sub(self.records.len())
    }

    /// All tracked records, busiest first.
    pub fn snapshot(&self) -> Vec<ViolationView> {
        let now = self.clock.now();
        let mut views: Vec<ViolationView> = self
            .records
            .iter()
            .map(|r| ViolationView {
                ip: *r.key(),
                count: self.live_count(r.value(), now),
                total: r.total,
                window_start: self.clock.to_wall(r.window_start),
                last_violation: self.clock.to_wall(r.last_violation),
            })
            .collect();
        views.sort_by(|a, b| b.total.cmp(&a.total).then(b.count.cmp(&a.count)).then(a.ip.cmp(&b.ip)));
        views
    }

    /// The `limit` IPs with the most violations.
    pub fn top_offenders(&self, limit: usize) -> Vec<ViolationView> {
        let mut views = self.snapshot();
        views.truncate(limit);
        views
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
