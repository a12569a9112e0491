//! Sharded registry of token buckets.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::{Acquire, Limit, TokenBucket};
use super::key::BucketKey;

/// Keyed store of token buckets, created lazily on first lookup.
///
/// Buckets live in a sharded map so lookups for unrelated keys do not
/// contend; the per-bucket lock is taken only after the shard guard has
/// been released.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    buckets: DashMap<BucketKey, Arc<TokenBucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token from the bucket for `key`, creating it with `limit`
    /// if it does not exist yet.
    pub fn acquire(&self, key: &BucketKey, limit: Limit, now: Instant) -> Acquire {
        let bucket = self.bucket(key, limit, now);
        let result = bucket.try_acquire(now);

        trace!(key = %key, admitted = result.is_admitted(), "Checked bucket");
        result
    }

    fn bucket(&self, key: &BucketKey, limit: Limit, now: Instant) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }

        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    rps = limit.rps,
                    burst = limit.burst,
                    "Creating new token bucket"
                );
                Arc::new(TokenBucket::new(limit, now))
            })
            .clone()
    }

    /// Tokens currently available for `key`, if the bucket exists.
    pub fn available(&self, key: &BucketKey, now: Instant) -> Option<f64> {
        let bucket = self.buckets.get(key)?.clone();
        Some(bucket.available(now))
    }

    /// Evict evictable buckets untouched for longer than `idle` that have
    /// also refilled completely; a recreated bucket starts full.
    ///
    /// A bucket still held by an in-flight acquire is kept. The shard write
    /// lock excludes new lookups, so its reference count is stable here.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, bucket| {
            let idle_for = now.saturating_duration_since(bucket.last_seen());
            !key.is_evictable()
                || idle_for <= idle
                || Arc::strong_count(bucket) > 1
                || !bucket.is_full_at(now)
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_registry_creation() {
        let registry = BucketRegistry::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_acquire_creates_bucket() {
        let registry = BucketRegistry::new();
        let now = Instant::now();
        let key = BucketKey::PerIp(ip("10.0.0.1"));

        assert!(registry.acquire(&key, Limit::new(1.0, 2.0), now).is_admitted());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.available(&key, now), Some(1.0));
    }

    #[test]
    fn test_limit_applies_only_at_creation() {
        let registry = BucketRegistry::new();
        let now = Instant::now();
        let key = BucketKey::PerIp(ip("10.0.0.1"));

        registry.acquire(&key, Limit::new(1.0, 1.0), now);
        // A later, larger limit does not resize the existing bucket
        assert!(!registry.acquire(&key, Limit::new(1.0, 50.0), now).is_admitted());
    }

    #[test]
    fn test_keys_have_separate_buckets() {
        let registry = BucketRegistry::new();
        let now = Instant::now();
        let limit = Limit::new(1.0, 1.0);
        let a = BucketKey::PerIp(ip("10.0.0.1"));
        let b = BucketKey::PerIp(ip("10.0.0.2"));

        assert!(registry.acquire(&a, limit, now).is_admitted());
        assert!(!registry.acquire(&a, limit, now).is_admitted());
        assert!(registry.acquire(&b, limit, now).is_admitted());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_evict_idle_keeps_global_and_recent() {
        let registry = BucketRegistry::new();
        let start = Instant::now();
        let limit = Limit::new(1.0, 1.0);
        let stale = BucketKey::PerIp(ip("10.0.0.1"));
        let fresh = BucketKey::PerIp(ip("10.0.0.2"));

        registry.acquire(&BucketKey::Global, limit, start);
        registry.acquire(&stale, limit, start);
        registry.acquire(&fresh, limit, start + Duration::from_secs(170));

        let removed = registry.evict_idle(start + Duration::from_secs(200), Duration::from_secs(180));
        assert_eq!(removed, 1);
        assert_eq!(registry.available(&stale, start), None);
        assert!(registry.available(&fresh, start).is_some());
        assert!(registry.available(&BucketKey::Global, start).is_some());
    }

    #[test]
    fn test_evict_idle_keeps_partially_drained_buckets() {
        let registry = BucketRegistry::new();
        let start = Instant::now();
        // One token per minute: three idle minutes refill only three of five
        let slow = Limit::new(1.0 / 60.0, 5.0);
        let key = BucketKey::PerIp(ip("10.0.0.1"));

        for _ in 0..5 {
            assert!(registry.acquire(&key, slow, start).is_admitted());
        }

        let later = start + Duration::from_secs(181);
        assert_eq!(registry.evict_idle(later, Duration::from_secs(180)), 0);
        assert_eq!(registry.len(), 1);

        // Once the bucket would be full again it can go
        let refilled = start + Duration::from_secs(301);
        assert_eq!(registry.evict_idle(refilled, Duration::from_secs(180)), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_idle_skips_buckets_in_use() {
        let registry = BucketRegistry::new();
        let start = Instant::now();
        let limit = Limit::new(1.0, 1.0);
        let key = BucketKey::PerIp(ip("10.0.0.1"));

        let held = registry.bucket(&key, limit, start);
        let later = start + Duration::from_secs(600);
        assert_eq!(registry.evict_idle(later, Duration::from_secs(180)), 0);

        drop(held);
        assert_eq!(registry.evict_idle(later, Duration::from_secs(180)), 1);
    }
}
