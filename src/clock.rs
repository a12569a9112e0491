//! Time sources for token refill and TTL expiry.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of time for the admission layer.
///
/// All expiry and refill arithmetic uses the monotonic `now()`. The wall
/// clock is only used to render timestamps for operators.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic current instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Utc>;

    /// Convert a monotonic instant into an approximate wall-clock time.
    fn to_wall(&self, at: Instant) -> DateTime<Utc> {
        let now = self.now();
        let wall = self.wall();
        if at >= now {
            wall + chrono::Duration::from_std(at - now).unwrap_or(chrono::Duration::zero())
        } else {
            wall - chrono::Duration::from_std(now - at).unwrap_or(chrono::Duration::zero())
        }
    }
}

/// Production clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_wall: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_wall: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.base_wall + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn test_to_wall_offsets() {
        let clock = ManualClock::new();
        let wall = clock.wall();
        let later = clock.now() + Duration::from_secs(60);
        assert_eq!(clock.to_wall(later), wall + chrono::Duration::seconds(60));

        clock.advance(Duration::from_secs(120));
        assert_eq!(clock.to_wall(later), wall + chrono::Duration::seconds(60));
    }
}
