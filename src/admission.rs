//! The per-request admission decision.
//!
//! Checks run in a fixed, short-circuiting order:
//!
//! 1. whitelist: admit immediately, no bucket touched
//! 2. blacklist or live ban: reject with `IP_BLOCKED`, no violation recorded
//! 3. global bucket
//! 4. per-IP bucket
//! 5. endpoint bucket, only when an override matches the request
//!
//! A bucket rejection in steps 3-5 records a violation, which may promote
//! the IP to a temporary ban. Tokens already taken by earlier buckets in the
//! chain are not refunded.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitPolicy;
use crate::error::{AdmissionError, BlockReason, GatekeeperError, LimitScope, Result};
use crate::metrics::{AdmissionMetrics, MetricsSnapshot, StateGauges};
use crate::ratelimit::{Acquire, BucketKey, BucketRegistry, EndpointRules, Limit};
use crate::security::{
    BanSource, ReputationStore, ReputationTarget, SecurityEvent, ViolationTracker,
};

/// Capacity of the security event channel. Slow subscribers lag and skip.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Remaining capacity of the most restrictive bucket a request went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
}

/// A request that may proceed to the business handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// `None` for whitelisted requests, which bypass every bucket.
    pub quota: Option<Quota>,
}

impl Admission {
    pub fn is_bypass(&self) -> bool {
        self.quota.is_none()
    }
}

/// Combines the bucket registry with the reputation overlay.
#[derive(Debug)]
pub struct AdmissionController {
    policy: RateLimitPolicy,
    global_limit: Limit,
    per_ip_limit: Limit,
    endpoints: EndpointRules,
    buckets: BucketRegistry,
    reputation: ReputationStore,
    violations: ViolationTracker,
    metrics: AdmissionMetrics,
    events: broadcast::Sender<SecurityEvent>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Create a controller on the system clock.
    pub fn new(policy: RateLimitPolicy) -> Result<Self> {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create a controller on the given clock. The policy is validated and
    /// its whitelist/blacklist seeds are loaded as permanent entries.
    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        policy.validate()?;
        let endpoints = EndpointRules::from_limits(&policy.endpoint_limits)?;
        let reputation = ReputationStore::new(clock.clone());

        for entry in &policy.whitelist {
            reputation.add_to_whitelist(parse_seed(entry)?, None);
        }
        for entry in &policy.blacklist {
            reputation.add_to_blacklist(parse_seed(entry)?, "configured blacklist", None);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            global_limit: Limit::new(policy.global_rps, policy.global_burst),
            per_ip_limit: Limit::new(policy.per_ip_rps, policy.per_ip_burst),
            endpoints,
            buckets: BucketRegistry::new(),
            violations: ViolationTracker::new(policy.auto_ban.clone(), clock.clone()),
            reputation,
            metrics: AdmissionMetrics::new(),
            events,
            clock,
            policy,
        })
    }

    /// Decide whether a request from `ip` for `method path` may proceed.
    pub fn check(&self, ip: IpAddr, method: &str, path: &str) -> std::result::Result<Admission, AdmissionError> {
        self.metrics.record_request();

        if self.reputation.is_whitelisted(&ip) {
            trace!(ip = %ip, "Whitelisted, bypassing rate limits");
            self.metrics.record_whitelisted();
            return Ok(Admission { quota: None });
        }

        if let Some(reason) = self.reputation.block_reason(&ip) {
            warn!(ip = %ip, reason = ?reason, "Rejecting blocked IP");
            self.metrics.record_blocked();
            self.publish(SecurityEvent::Blocked {
                ip,
                reason: match &reason {
                    BlockReason::Blacklisted(r) | BlockReason::Banned(r) => r.clone(),
                },
            });
            return Err(AdmissionError::IpBlocked { ip, reason });
        }

        let now = self.clock.now();
        let mut quota = None;

        let chain = [
            (BucketKey::Global, self.global_limit, LimitScope::Global),
            (BucketKey::PerIp(ip), self.per_ip_limit, LimitScope::PerIp),
        ];
        for (key, limit, scope) in chain {
            self.consume(&key, limit, scope, ip, method, path, now, &mut quota)?;
        }

        if let Some(rule) = self.endpoints.find(method, path) {
            let key = BucketKey::endpoint(rule.method().clone(), rule.pattern(), ip);
            self.consume(&key, rule.limit(), LimitScope::Endpoint, ip, method, path, now, &mut quota)?;
        }

        self.metrics.record_admitted();
        trace!(ip = %ip, method = %method, path = %path, quota = ?quota, "Admitted");
        Ok(Admission { quota })
    }

    #[allow(clippy::too_many_arguments)]
    fn consume(
        &self,
        key: &BucketKey,
        limit: Limit,
        scope: LimitScope,
        ip: IpAddr,
        method: &str,
        path: &str,
        now: std::time::Instant,
        quota: &mut Option<Quota>,
    ) -> std::result::Result<(), AdmissionError> {
        match self.buckets.acquire(key, limit, now) {
            Acquire::Admitted { limit, remaining } => {
                // Later buckets win ties: they are the more specific limit.
                if quota.map_or(true, |q| remaining <= q.remaining) {
                    *quota = Some(Quota { limit, remaining });
                }
                Ok(())
            }
            Acquire::Rejected { limit, retry_after } => {
                self.metrics.record_rate_limited();
                let banned = self.record_violation(ip, scope, method, path);
                debug!(
                    ip = %ip,
                    scope = %scope,
                    method = %method,
                    path = %path,
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limit exceeded"
                );
                Err(AdmissionError::RateLimited {
                    ip,
                    scope,
                    limit,
                    retry_after,
                    banned,
                })
            }
        }
    }

    /// Count a violation and ban the IP if it crossed the threshold.
    /// Returns whether a ban was issued.
    fn record_violation(&self, ip: IpAddr, scope: LimitScope, method: &str, path: &str) -> bool {
        let outcome = self.violations.record_violation(ip);
        self.publish(SecurityEvent::RateLimited {
            ip,
            scope: scope.as_str(),
            method: method.to_string(),
            path: path.to_string(),
            violations: outcome.count,
        });

        if !outcome.promote {
            return false;
        }

        let auto_ban = &self.policy.auto_ban;
        let reason = format!(
            "auto-ban: exceeded {} violations in window",
            auto_ban.threshold
        );
        let ban = self
            .reputation
            .ban(ip, &reason, auto_ban.ban_duration(), BanSource::Auto);
        self.metrics.record_auto_ban();

        warn!(
            ip = %ip,
            violations = outcome.count,
            ban_secs = auto_ban.ban_duration_secs,
            "IP auto-banned after repeated rate limit violations"
        );
        self.publish(SecurityEvent::AutoBanned {
            ip,
            reason,
            expires_at: self.clock.to_wall(ban.expires_at),
        });
        true
    }

    fn publish(&self, event: SecurityEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Subscribe to security events.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn reputation(&self) -> &ReputationStore {
        &self.reputation
    }

    pub fn violations(&self) -> &ViolationTracker {
        &self.violations
    }

    pub fn buckets(&self) -> &BucketRegistry {
        &self.buckets
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.metrics.counters(),
            gauges: StateGauges {
                active_buckets: self.buckets.len(),
                active_bans: self.reputation.ban_count(),
                blacklist_entries: self.reputation.blacklist_len(),
                whitelist_entries: self.reputation.whitelist_len(),
                tracked_violators: self.violations.len(),
            },
        }
    }
}

fn parse_seed(entry: &str) -> Result<ReputationTarget> {
    entry
        .parse()
        .map_err(|e| GatekeeperError::Config(format!("Invalid reputation entry '{}': {}", entry, e)))
}
