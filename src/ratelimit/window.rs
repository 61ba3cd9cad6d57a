//! Per-key sliding window state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::category::Category;
use super::decision::Decision;
use super::key::RateLimitKey;
use super::policy::LimitPolicy;

/// Stand-in for "never" when an instant would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `at + duration`, clamped to a far-future instant instead of panicking.
fn instant_after(at: Instant, duration: Duration) -> Instant {
    at.checked_add(duration)
        .or_else(|| at.checked_add(FAR_FUTURE))
        .unwrap_or(at)
}

/// Result of admitting one request against a [`WindowEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Verdict {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
    pub retry_after: Option<Duration>,
    /// Denied because of a lockout, new or ongoing
    pub blocked: bool,
    /// This request is the one that started the lockout
    pub lockout_started: bool,
}

impl Verdict {
    pub fn into_decision(self, category: Category, key: RateLimitKey, limit: u32) -> Decision {
        Decision {
            category,
            key,
            allowed: self.allowed,
            limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            retry_after: self.retry_after,
            blocked: self.blocked,
        }
    }
}

/// Recent requests and lockout state for one `(category, key)` pair.
///
/// Not synchronized on its own; the limiter keeps each entry behind a mutex.
#[derive(Debug)]
pub struct WindowEntry {
    /// Request instants inside the trailing window, oldest first
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
    /// Set once the janitor has removed this entry from the map
    evicted: bool,
}

impl WindowEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
            evicted: false,
        }
    }

    /// Drop every timestamp that is at least `window` old.
    pub fn compact(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    pub fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }

    /// Requests currently counted, as of the last compaction.
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Record one request and decide whether it is admitted.
    pub(crate) fn admit(&mut self, policy: &LimitPolicy, now: Instant) -> Verdict {
        self.last_seen = self.last_seen.max(now);

        if let Some(until) = self.blocked_until {
            if now < until {
                return Verdict {
                    allowed: false,
                    remaining: 0,
                    reset_at: until,
                    retry_after: Some(until - now),
                    blocked: true,
                    lockout_started: false,
                };
            }
            self.blocked_until = None;
        }

        self.compact(now, policy.window);

        let limit = policy.max_requests as usize;
        if self.timestamps.len() >= limit {
            if policy.blocks() {
                let until = instant_after(now, policy.block_duration);
                self.blocked_until = Some(until);
                return Verdict {
                    allowed: false,
                    remaining: 0,
                    reset_at: until,
                    retry_after: Some(until.saturating_duration_since(now)),
                    blocked: true,
                    lockout_started: true,
                };
            }

            let reset_at = self.window_reset(now, policy.window);
            return Verdict {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after: Some(reset_at.saturating_duration_since(now)),
                blocked: false,
                lockout_started: false,
            };
        }

        // Keep the queue ordered even if the clock stepped backwards
        let pos = self.timestamps.partition_point(|t| *t <= now);
        self.timestamps.insert(pos, now);

        Verdict {
            allowed: true,
            remaining: policy.max_requests.saturating_sub(self.timestamps.len() as u32),
            reset_at: self.window_reset(now, policy.window),
            retry_after: None,
            blocked: false,
            lockout_started: false,
        }
    }

    fn window_reset(&self, now: Instant, window: Duration) -> Instant {
        instant_after(self.timestamps.front().copied().unwrap_or(now), window)
    }

    /// Lift any block and forget the counted requests.
    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.blocked_until = None;
    }

    /// Whether the janitor may drop this entry: no active block, nothing left
    /// in the window, and idle for longer than `retention`.
    pub fn is_evictable(&mut self, now: Instant, window: Duration, retention: Duration) -> bool {
        if self.is_blocked(now) {
            return false;
        }
        self.compact(now, window);
        self.timestamps.is_empty() && now.saturating_duration_since(self.last_seen) > retention
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }
}
