//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    /// Tokens added per second
    pub rps: f64,
    /// Maximum tokens held, i.e. the burst size
    pub burst: f64,
}

impl Limit {
    pub fn new(rps: f64, burst: f64) -> Self {
        Self { rps, burst }
    }
}

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    /// One token was taken.
    Admitted { limit: u64, remaining: u64 },
    /// Not enough tokens. The bucket was left untouched apart from refill.
    Rejected { limit: u64, retry_after: Duration },
}

impl Acquire {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Acquire::Admitted { .. })
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket holding up to `capacity` tokens, refilled continuously.
///
/// Refill and consumption happen under one short per-bucket lock, so
/// concurrent callers can never push `tokens` above capacity or below zero.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(limit: Limit, now: Instant) -> Self {
        Self {
            capacity: limit.burst,
            refill_rate: limit.rps,
            state: Mutex::new(BucketState {
                tokens: limit.burst,
                last_refill: now,
            }),
        }
    }

    /// Refill, then take one token if available.
    pub fn try_acquire(&self, now: Instant) -> Acquire {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Acquire::Admitted {
                limit: self.limit(),
                remaining: state.tokens.floor() as u64,
            }
        } else {
            let missing = 1.0 - state.tokens;
            let secs = (missing / self.refill_rate).ceil().max(1.0);
            Acquire::Rejected {
                limit: self.limit(),
                retry_after: Duration::from_secs(secs as u64),
            }
        }
    }

    /// Tokens available at `now`, after refill.
    pub fn available(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// The last time this bucket was touched.
    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_refill
    }

    /// Whether the bucket would hold its full burst at `now`. A full bucket
    /// is indistinguishable from a freshly created one.
    pub fn is_full_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens + elapsed.as_secs_f64() * self.refill_rate >= self.capacity
    }

    /// Capacity as reported in `X-RateLimit-Limit`.
    pub fn limit(&self) -> u64 {
        self.capacity.floor() as u64
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A reading older than last_refill adds nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}
