//! Admission decisions.

use std::time::{Duration, Instant};

use super::category::Category;
use super::key::RateLimitKey;

/// Outcome of one admission check.
///
/// A denial is a normal decision, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub category: Category,
    /// The key the request was charged against
    pub key: RateLimitKey,
    pub allowed: bool,
    /// The category's `max_requests`
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the window, or when the block lifts
    pub reset_at: Instant,
    /// How long the caller should wait before retrying; set only on denial
    pub retry_after: Option<Duration>,
    /// True when the denial comes from an active lockout
    pub blocked: bool,
}

impl Decision {
    /// Time from `now` until [`reset_at`](Self::reset_at), clamped at zero.
    pub fn reset_after(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }

    /// Whole seconds to advertise in a `Retry-After` style hint, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}
