//! Background cleanup of expired and idle admission state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::admission::AdmissionController;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub bans: usize,
    pub blacklist: usize,
    pub whitelist: usize,
    pub violations: usize,
    pub buckets: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.bans + self.blacklist + self.whitelist + self.violations + self.buckets
    }
}

/// Periodically evicts expired bans and reputation entries, stale violation
/// records, and idle buckets.
///
/// The sweeper is an ordinary concurrent mutator: it walks the same sharded
/// maps as the request path, one shard at a time, and never pauses
/// admission globally.
#[derive(Debug, Clone)]
pub struct Sweeper {
    controller: Arc<AdmissionController>,
    interval: Duration,
    bucket_idle: Duration,
}

impl Sweeper {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        let policy = controller.policy();
        let interval = policy.cleanup_interval();
        let bucket_idle = policy.bucket_idle_timeout();
        Self {
            controller,
            interval,
            bucket_idle,
        }
    }

    /// Run one cleanup pass.
    pub fn sweep_once(&self) -> SweepReport {
        let purged = self.controller.reputation().purge_expired();
        let violations = self.controller.violations().purge_stale();
        let now = self.controller.clock().now();
        let buckets = self.controller.buckets().evict_idle(now, self.bucket_idle);

        SweepReport {
            bans: purged.bans,
            blacklist: purged.blacklist,
            whitelist: purged.whitelist,
            violations,
            buckets,
        }
    }

    /// Spawn the sweep loop. It exits when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Cleanup sweeper started");

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing to clean yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once();
                        debug!(
                            removed = report.total(),
                            bans = report.bans,
                            blacklist = report.blacklist,
                            whitelist = report.whitelist,
                            violations = report.violations,
                            buckets = report.buckets,
                            "Cleanup sweep finished"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Cleanup sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AutoBanConfig, EndpointLimit, RateLimitPolicy};
    use crate::security::BanSource;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<AdmissionController>) {
        let clock = Arc::new(ManualClock::new());
        let policy = RateLimitPolicy {
            per_ip_rps: 1.0,
            per_ip_burst: 1.0,
            cleanup_interval_secs: 60,
            bucket_idle_intervals: 3,
            auto_ban: AutoBanConfig {
                enabled: true,
                threshold: 100,
                window_secs: 60,
                ban_duration_secs: 300,
            },
            ..RateLimitPolicy::default()
        };
        let controller = Arc::new(AdmissionController::with_clock(policy, clock.clone()).unwrap());
        (clock, controller)
    }

    #[test]
    fn test_sweep_removes_expired_state() {
        let (clock, controller) = setup();
        let reputation = controller.reputation();
        reputation.ban(ip("10.0.0.1"), "short", Duration::from_secs(30), BanSource::Manual);
        reputation.ban(ip("10.0.0.2"), "long", Duration::from_secs(3600), BanSource::Manual);
        reputation.add_to_blacklist(ip("10.0.0.3").into(), "ttl", Some(Duration::from_secs(30)));
        reputation.add_to_whitelist(ip("10.0.0.4").into(), Some(Duration::from_secs(30)));

        // One violation and two buckets (global + per-IP) for 10.0.0.5
        controller.check(ip("10.0.0.5"), "GET", "/").unwrap();
        let _ = controller.check(ip("10.0.0.5"), "GET", "/");
        assert_eq!(controller.violations().len(), 1);
        assert_eq!(controller.buckets().len(), 2);

        let sweeper = Sweeper::new(controller.clone());
        assert_eq!(sweeper.sweep_once().total(), 0);

        clock.advance(Duration::from_secs(200));
        let report = sweeper.sweep_once();
        assert_eq!(
            report,
            SweepReport {
                bans: 1,
                blacklist: 1,
                whitelist: 1,
                violations: 1,
                buckets: 1,
            }
        );
        assert!(controller.reputation().is_banned(&ip("10.0.0.2")));
        // The global bucket survives
        assert_eq!(controller.buckets().len(), 1);
    }

    #[test]
    fn test_recent_buckets_survive() {
        let (clock, controller) = setup();
        controller.check(ip("10.0.0.5"), "GET", "/").unwrap();
        clock.advance(Duration::from_secs(170));
        controller.check(ip("10.0.0.6"), "GET", "/").unwrap();
        clock.advance(Duration::from_secs(20));

        let report = Sweeper::new(controller.clone()).sweep_once();
        assert_eq!(report.buckets, 1);
        assert_eq!(controller.buckets().len(), 2);
    }

    #[test]
    fn test_sweep_does_not_refill_slow_endpoint_bucket() {
        let clock = Arc::new(ManualClock::new());
        let policy = RateLimitPolicy {
            per_ip_rps: 100.0,
            per_ip_burst: 100.0,
            cleanup_interval_secs: 60,
            bucket_idle_intervals: 3,
            endpoint_limits: vec![EndpointLimit {
                method: "POST".to_string(),
                path: "/auth/reset".to_string(),
                rps: 1.0 / 60.0,
                burst: 5.0,
            }],
            auto_ban: AutoBanConfig {
                enabled: false,
                ..AutoBanConfig::default()
            },
            ..RateLimitPolicy::default()
        };
        let controller = Arc::new(AdmissionController::with_clock(policy, clock.clone()).unwrap());
        let sweeper = Sweeper::new(controller.clone());
        let client = ip("10.0.0.1");

        let mut admitted = 0;
        for _ in 0..10 {
            if controller.check(client, "POST", "/auth/reset").is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        // Idle past the eviction timeout, but only three tokens back
        clock.advance(Duration::from_secs(181));
        sweeper.sweep_once();

        for _ in 0..10 {
            if controller.check(client, "POST", "/auth/reset").is_ok() {
                admitted += 1;
            }
        }
        // ceil(burst + rps * 181s) = 9
        assert!(admitted <= 9, "admitted {} over 181s", admitted);
        assert_eq!(admitted, 8);
    }

    #[test]
    fn test_sweep_concurrent_with_admission() {
        let clock = Arc::new(ManualClock::new());
        let policy = RateLimitPolicy {
            global_rps: 1_000_000.0,
            global_burst: 1_000_000.0,
            per_ip_rps: 1.0,
            per_ip_burst: 5.0,
            cleanup_interval_secs: 1,
            bucket_idle_intervals: 1,
            auto_ban: AutoBanConfig {
                enabled: true,
                threshold: 20,
                window_secs: 2,
                ban_duration_secs: 3,
            },
            ..RateLimitPolicy::default()
        };
        let controller = Arc::new(AdmissionController::with_clock(policy, clock.clone()).unwrap());
        let sweeper = Sweeper::new(controller.clone());
        let done = Arc::new(AtomicBool::new(false));
        let ticks = 50u64;

        let sweeping = {
            let clock = clock.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for _ in 0..ticks {
                    clock.advance(Duration::from_secs(1));
                    sweeper.sweep_once();
                    std::thread::yield_now();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let controller = controller.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let client: IpAddr = format!("10.0.1.{}", n).parse().unwrap();
                    let mut admitted = 0u64;
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        if controller.check(client, "GET", "/").is_ok() {
                            admitted += 1;
                        }
                        if finished {
                            break;
                        }
                        std::thread::yield_now();
                    }
                    admitted
                })
            })
            .collect();

        sweeping.join().unwrap();
        for worker in workers {
            let admitted = worker.join().unwrap();
            // burst 5 plus 1 rps over the 50 seconds the clock moved
            assert!(admitted <= 5 + ticks, "admitted {}", admitted);
            assert!(admitted >= 1);
        }
    }

    #[tokio::test]
    async fn test_spawned_sweeper_stops_on_shutdown() {
        let (_, controller) = setup();
        let (tx, rx) = watch::channel(false);
        let handle = Sweeper::new(controller).spawn(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_periodically() {
        let (_, controller) = setup();
        controller
            .reputation()
            .ban(ip("10.0.0.1"), "gone", Duration::ZERO, BanSource::Manual);
        assert_eq!(controller.reputation().ban_count(), 1);

        let (tx, rx) = watch::channel(false);
        let handle = Sweeper::new(controller.clone()).spawn(rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(controller.reputation().ban_count(), 0);

        drop(tx);
        handle.await.unwrap();
    }
}
