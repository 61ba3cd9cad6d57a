//! Aggregate limiter statistics.
//!
//! Counters are lock-free atomics. A snapshot taken while checks are in
//! flight may lag behind them, and never reports more allowed plus denied
//! requests than total requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::category::Category;

/// Request and denial totals for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub requests: u64,
    pub denied: u64,
}

/// Point-in-time view of the limiter. Aggregate numbers only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Window entries currently held
    pub tracked_keys: u64,
    /// Entries with a lockout in force
    pub blocked_keys: u64,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    /// Checks that observed time moving backwards
    pub clock_anomalies: u64,
    pub categories: BTreeMap<Category, CategoryStats>,
    /// Start of the counting period (startup or last reset)
    pub since: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CategoryCounters {
    requests: AtomicU64,
    denied: AtomicU64,
}

/// Lock-free counters updated on every check.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    clock_anomalies: AtomicU64,
    categories: [CategoryCounters; Category::COUNT],
    since: RwLock<DateTime<Utc>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            clock_anomalies: AtomicU64::new(0),
            categories: Default::default(),
            since: RwLock::new(Utc::now()),
        }
    }

    /// Count one check. `total` and `requests` are bumped before the
    /// outcome counters, which are published with `Release`.
    pub fn record(&self, category: Category, allowed: bool) {
        let counters = &self.categories[category.index()];
        self.total.fetch_add(1, Ordering::Relaxed);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Release);
        } else {
            self.denied.fetch_add(1, Ordering::Release);
            counters.denied.fetch_add(1, Ordering::Release);
        }
    }

    pub fn record_clock_anomaly(&self) {
        self.clock_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter and restart the counting period.
    pub fn reset(&self) {
        self.take(0, 0);
    }

    pub fn snapshot(&self, tracked_keys: u64, blocked_keys: u64) -> StatsSnapshot {
        let since = *self.since.read();
        self.collect(tracked_keys, blocked_keys, since, |counter| {
            counter.load(Ordering::Acquire)
        })
    }

    /// Read and zero the counters in one pass, starting a new period.
    ///
    /// Each check lands in exactly one period, so consecutive takes add up
    /// to every check ever recorded.
    pub fn take(&self, tracked_keys: u64, blocked_keys: u64) -> StatsSnapshot {
        let mut since = self.since.write();
        let started = std::mem::replace(&mut *since, Utc::now());
        self.collect(tracked_keys, blocked_keys, started, |counter| {
            counter.swap(0, Ordering::AcqRel)
        })
    }

    /// Outcome counters are read before `total` and `requests`, so a
    /// snapshot never shows more outcomes than requests.
    fn collect(
        &self,
        tracked_keys: u64,
        blocked_keys: u64,
        since: DateTime<Utc>,
        read: impl Fn(&AtomicU64) -> u64,
    ) -> StatsSnapshot {
        let allowed_requests = read(&self.allowed);
        let denied_requests = read(&self.denied);

        let categories = Category::ALL
            .iter()
            .map(|category| {
                let counters = &self.categories[category.index()];
                let denied = read(&counters.denied);
                let requests = read(&counters.requests);
                (*category, CategoryStats { requests, denied })
            })
            .collect();

        StatsSnapshot {
            tracked_keys,
            blocked_keys,
            total_requests: read(&self.total),
            allowed_requests,
            denied_requests,
            clock_anomalies: read(&self.clock_anomalies),
            categories,
            since,
            collected_at: Utc::now(),
        }
    }
}
