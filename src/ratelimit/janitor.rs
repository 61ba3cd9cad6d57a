//! Background eviction of idle rate limit entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;

/// Periodically removes entries that are idle, unblocked and empty.
///
/// Each entry is examined and removed on its own, so a sweep never holds
/// more than one shard lock at a time and can stop between any two entries.
pub struct Janitor {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    retention: Duration,
}

impl Janitor {
    /// Create a janitor for `limiter`.
    ///
    /// `retention` is raised to the longest window or block duration in the
    /// policy table if it is shorter.
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration, retention: Duration) -> Self {
        let horizon = limiter.policies().longest_horizon();
        let retention = if retention < horizon {
            warn!(
                configured_secs = retention.as_secs(),
                horizon_secs = horizon.as_secs(),
                "Retention shorter than the longest policy horizon, raising it"
            );
            horizon
        } else {
            retention
        };

        Self {
            limiter,
            interval,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass over every tracked entry, returning how many were evicted.
    pub fn sweep(&self) -> usize {
        let keys = self.limiter.entry_keys();
        let scanned = keys.len();

        let evicted = keys
            .iter()
            .filter(|key| self.limiter.evict_if_expired(key, self.retention))
            .count();

        debug!(scanned = scanned, evicted = evicted, "Rate limit sweep finished");
        evicted
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                retention_secs = self.retention.as_secs(),
                "Rate limit janitor started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep();
                        if evicted > 0 {
                            info!(
                                evicted = evicted,
                                remaining = self.limiter.tracked_keys(),
                                "Evicted idle rate limit entries"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Rate limit janitor stopped");
        })
    }
}
