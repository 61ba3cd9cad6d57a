//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::category::Category;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::key::{EntryKey, KeyResolver, RateLimitKey};
use super::policy::{PolicyTable, Profile};
use super::stats::{StatsCollector, StatsSnapshot};
use super::window::WindowEntry;
use crate::error::Result;

type EntryHandle = Arc<Mutex<WindowEntry>>;

/// The admission engine.
///
/// Entries live in a sharded map. Each one sits behind its own mutex, so
/// checks on the same `(category, key)` are serialized while checks on other
/// keys only touch their shard long enough to fetch a handle.
pub struct RateLimiter {
    entries: DashMap<EntryKey, EntryHandle>,
    policies: PolicyTable,
    resolver: KeyResolver,
    clock: Arc<dyn Clock>,
    stats: StatsCollector,
}

impl RateLimiter {
    /// Create a rate limiter over a policy table, using the system clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self {
            entries: DashMap::new(),
            policies,
            resolver: KeyResolver::default(),
            clock: Arc::new(SystemClock),
            stats: StatsCollector::new(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the key resolver.
    pub fn with_resolver(mut self, resolver: KeyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Check and record one request.
    ///
    /// The request is charged to the identity when one is given, otherwise
    /// to the normalized address.
    pub fn check(&self, category: Category, identity: Option<&str>, address: &str) -> Result<Decision> {
        let key = self.resolver.resolve(identity, address);
        self.check_key(category, &key)
    }

    /// Check and record one request against an already resolved key.
    pub fn check_key(&self, category: Category, key: &RateLimitKey) -> Result<Decision> {
        let policy = *self.policies.policy_for(category)?;
        let entry_key = EntryKey::new(category, key.clone());

        loop {
            let handle = self.entry(&entry_key);
            let mut entry = handle.lock();

            // Lost a race with the janitor; the map now holds a fresh entry
            if entry.is_evicted() {
                continue;
            }

            let now = self.clock.now();
            if now < entry.last_seen() {
                self.stats.record_clock_anomaly();
                warn!(
                    key = %entry_key,
                    behind_ms = (entry.last_seen() - now).as_millis() as u64,
                    "Clock moved backwards, clamping"
                );
            }

            let verdict = entry.admit(&policy, now);
            drop(entry);

            self.stats.record(category, verdict.allowed);

            trace!(
                key = %entry_key,
                allowed = verdict.allowed,
                remaining = verdict.remaining,
                "Checked rate limit"
            );

            if verdict.lockout_started {
                debug!(
                    key = %entry_key,
                    limit = policy.max_requests,
                    block_secs = policy.block_duration.as_secs(),
                    "Rate limit exceeded, lockout started"
                );
            } else if !verdict.allowed && !verdict.blocked {
                debug!(
                    key = %entry_key,
                    limit = policy.max_requests,
                    "Rate limit exceeded"
                );
            }

            return Ok(verdict.into_decision(category, key.clone(), policy.max_requests));
        }
    }

    /// Fetch or lazily create the entry handle for a key.
    fn entry(&self, key: &EntryKey) -> EntryHandle {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }

        let handle = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, "Creating new rate limit window");
                Arc::new(Mutex::new(WindowEntry::new(self.clock.now())))
            });
        Arc::clone(handle.value())
    }

    fn handle(&self, category: Category, key: &RateLimitKey) -> Option<EntryHandle> {
        let entry_key = EntryKey::new(category, key.clone());
        self.entries.get(&entry_key).map(|e| Arc::clone(e.value()))
    }

    /// Lift the lockout and clear the window for one key.
    ///
    /// Returns `false` if the key is not tracked.
    pub fn clear_block(&self, category: Category, key: &RateLimitKey) -> bool {
        let Some(handle) = self.handle(category, key) else {
            return false;
        };

        let mut entry = handle.lock();
        if entry.is_evicted() {
            return false;
        }

        let was_blocked = entry.is_blocked(self.clock.now());
        entry.clear();
        drop(entry);

        info!(
            category = %category,
            key_kind = key.kind(),
            was_blocked = was_blocked,
            "Rate limit block cleared by operator"
        );
        true
    }

    /// When the lockout on a key lifts, if one is in force.
    pub fn blocked_until(&self, category: Category, key: &RateLimitKey) -> Option<Instant> {
        let now = self.clock.now();
        let handle = self.handle(category, key)?;
        let entry = handle.lock();
        entry.blocked_until().filter(|until| now < *until)
    }

    /// Requests currently counted in a key's window.
    ///
    /// Returns `None` if the key is not tracked.
    pub fn window_count(&self, category: Category, key: &RateLimitKey) -> Option<usize> {
        let policy = self.policies.policy_for(category).ok()?;
        let now = self.clock.now();
        let handle = self.handle(category, key)?;
        let mut entry = handle.lock();
        entry.compact(now, policy.window);
        Some(entry.count())
    }

    /// Aggregate statistics. Never waits on an entry lock.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (tracked, blocked) = self.key_counts();
        self.stats.snapshot(tracked, blocked)
    }

    /// Aggregate statistics, zeroing the counters in the same pass.
    pub fn take_snapshot(&self) -> StatsSnapshot {
        let (tracked, blocked) = self.key_counts();
        let snapshot = self.stats.take(tracked, blocked);
        info!(total_requests = snapshot.total_requests, "Rate limit statistics taken and reset");
        snapshot
    }

    /// Zero the request counters and restart the statistics period.
    pub fn reset_stats(&self) {
        self.stats.reset();
        info!("Rate limit statistics reset");
    }

    fn key_counts(&self) -> (u64, u64) {
        let now = self.clock.now();
        let mut tracked = 0u64;
        let mut blocked = 0u64;

        for item in self.entries.iter() {
            tracked += 1;
            // An entry locked by a check right now is skipped rather than waited on
            if let Some(entry) = item.value().try_lock() {
                if entry.is_blocked(now) {
                    blocked += 1;
                }
            }
        }

        (tracked, blocked)
    }

    /// Drop every tracked entry.
    pub fn clear(&self) {
        self.entries.retain(|_, handle| {
            handle.lock().mark_evicted();
            false
        });
    }

    /// Get the number of tracked entries.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Keys currently in the map.
    pub(crate) fn entry_keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|item| item.key().clone()).collect()
    }

    /// Remove one entry if it is idle past `retention`, unblocked and empty.
    ///
    /// Only the shard holding `key` is locked, and only for this entry.
    pub(crate) fn evict_if_expired(&self, key: &EntryKey, retention: Duration) -> bool {
        let Ok(policy) = self.policies.policy_for(key.category) else {
            return false;
        };
        let now = self.clock.now();

        self.entries
            .remove_if(key, |_, handle| {
                let mut entry = handle.lock();
                if entry.is_evictable(now, policy.window, retention) {
                    entry.mark_evicted();
                    true
                } else {
                    false
                }
            })
            .is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(PolicyTable::builtin(Profile::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::LimitPolicy;
    use std::sync::Barrier;
    use std::thread;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter_with(policies: PolicyTable) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(policies).with_clock(clock.clone());
        (limiter, clock)
    }

    fn builtin_limiter() -> (RateLimiter, Arc<ManualClock>) {
        limiter_with(PolicyTable::builtin(Profile::Development))
    }

    fn identity(id: &str) -> RateLimitKey {
        RateLimitKey::Identity(id.to_string())
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_check_creates_entry() {
        let (limiter, _) = builtin_limiter();
        let decision = limiter.check(Category::ApiRead, None, "10.0.0.1").unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.remaining, 999);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_unknown_category_is_an_error() {
        let table = PolicyTable::empty().with_policy(LimitPolicy::new(
            Category::ApiRead,
            10,
            MINUTE,
            Duration::ZERO,
        ));
        let (limiter, _) = limiter_with(table);

        let err = limiter.check(Category::Upload, Some("u1"), "10.0.0.1").unwrap_err();
        assert!(matches!(err, TollgateError::UnknownCategory(_)));
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.snapshot().total_requests, 0);
    }

    #[test]
    fn test_quota_correctness() {
        let table = PolicyTable::empty().with_policy(LimitPolicy::new(
            Category::ApiWrite,
            10,
            MINUTE,
            Duration::ZERO,
        ));
        let (limiter, clock) = limiter_with(table);
        let key = identity("writer");

        for _ in 0..10 {
            assert!(limiter.check_key(Category::ApiWrite, &key).unwrap().allowed);
            clock.advance(Duration::from_secs(1));
        }

        let denied = limiter.check_key(Category::ApiWrite, &key).unwrap();
        assert!(!denied.allowed);
        assert!(!denied.blocked);
        assert_eq!(denied.remaining, 0);
        // Oldest request was 10s ago, so it leaves the window in 50s
        assert_eq!(denied.retry_after, Some(Duration::from_secs(50)));
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let (limiter, clock) = builtin_limiter();
        let key = identity("uploader");

        for _ in 0..20 {
            assert!(limiter.check_key(Category::Upload, &key).unwrap().allowed);
        }
        assert!(!limiter.check_key(Category::Upload, &key).unwrap().allowed);

        clock.advance(Duration::from_secs(3600));
        let decision = limiter.check_key(Category::Upload, &key).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 19);
    }

    #[test]
    fn test_authentication_lockout_scenario() {
        let (limiter, clock) = builtin_limiter();
        let start = clock.now();
        let key = identity("u1");

        let remaining: Vec<u32> = (0..5)
            .map(|_| {
                let decision = limiter.check_key(Category::Authentication, &key).unwrap();
                assert!(decision.allowed);
                clock.advance(MINUTE);
                decision.remaining
            })
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        // Minute 10: sixth call starts a 30 minute lockout
        clock.set(start + 10 * MINUTE);
        let sixth = limiter.check_key(Category::Authentication, &key).unwrap();
        assert!(!sixth.allowed);
        assert!(sixth.blocked);
        assert_eq!(sixth.reset_at, start + 40 * MINUTE);
        assert_eq!(limiter.blocked_until(Category::Authentication, &key), Some(start + 40 * MINUTE));

        // Minute 20: still blocked
        clock.set(start + 20 * MINUTE);
        let seventh = limiter.check_key(Category::Authentication, &key).unwrap();
        assert!(!seventh.allowed);
        assert_eq!(seventh.retry_after, Some(20 * MINUTE));

        // Minute 41: evaluated fresh
        clock.set(start + 41 * MINUTE);
        let eighth = limiter.check_key(Category::Authentication, &key).unwrap();
        assert!(eighth.allowed);
        assert_eq!(eighth.remaining, 4);
    }

    #[test]
    fn test_retry_after_decreases_during_block() {
        let (limiter, clock) = builtin_limiter();
        let key = identity("attacker");

        for _ in 0..6 {
            limiter.check_key(Category::Registration, &key).unwrap();
        }

        let mut last = Duration::MAX;
        for _ in 0..6 {
            clock.advance(10 * MINUTE);
            let decision = limiter.check_key(Category::Registration, &key).unwrap();
            match decision.retry_after {
                Some(retry_after) if !decision.allowed => {
                    assert!(retry_after < last);
                    last = retry_after;
                }
                _ => {
                    // Block lifts exactly one hour after it started
                    assert!(decision.allowed);
                    assert_eq!(last, 10 * MINUTE);
                }
            }
        }
    }

    #[test]
    fn test_block_is_not_extended_by_retries() {
        let (limiter, clock) = builtin_limiter();
        let key = identity("u2");

        for _ in 0..6 {
            limiter.check_key(Category::Authentication, &key).unwrap();
        }
        let until = limiter.blocked_until(Category::Authentication, &key).unwrap();

        for _ in 0..10 {
            clock.advance(MINUTE);
            assert!(!limiter.check_key(Category::Authentication, &key).unwrap().allowed);
        }
        assert_eq!(limiter.blocked_until(Category::Authentication, &key), Some(until));
    }

    #[test]
    fn test_key_precedence() {
        let (limiter, _) = builtin_limiter();

        for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            limiter.check(Category::ApiWrite, Some("u1"), address).unwrap();
        }
        assert_eq!(limiter.window_count(Category::ApiWrite, &identity("u1")), Some(3));
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.check(Category::ApiWrite, None, "10.0.0.1:4000").unwrap();
        limiter.check(Category::ApiWrite, None, "10.0.0.1").unwrap();
        limiter.check(Category::ApiWrite, None, "10.0.0.2").unwrap();
        let address = RateLimitKey::Address("10.0.0.1".to_string());
        assert_eq!(limiter.window_count(Category::ApiWrite, &address), Some(2));
        assert_eq!(limiter.tracked_keys(), 3);
    }

    #[test]
    fn test_isolation_between_categories_and_keys() {
        let (limiter, _) = builtin_limiter();
        let key = identity("k");

        for _ in 0..6 {
            limiter.check_key(Category::Authentication, &key).unwrap();
        }
        assert!(!limiter.check_key(Category::Authentication, &key).unwrap().allowed);

        assert!(limiter.check_key(Category::Registration, &key).unwrap().allowed);
        assert!(limiter.check_key(Category::Authentication, &identity("k2")).unwrap().allowed);
    }

    #[test]
    fn test_clear_block() {
        let (limiter, _) = builtin_limiter();
        let key = identity("false-positive");

        for _ in 0..6 {
            limiter.check_key(Category::Authentication, &key).unwrap();
        }
        assert!(limiter.blocked_until(Category::Authentication, &key).is_some());

        assert!(limiter.clear_block(Category::Authentication, &key));
        assert!(limiter.blocked_until(Category::Authentication, &key).is_none());

        let decision = limiter.check_key(Category::Authentication, &key).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_clear_block_untracked_key() {
        let (limiter, _) = builtin_limiter();
        assert!(!limiter.clear_block(Category::Authentication, &identity("nobody")));
    }

    #[test]
    fn test_clock_anomaly_is_clamped_and_counted() {
        let (limiter, clock) = builtin_limiter();
        let key = identity("skewed");

        limiter.check_key(Category::ApiRead, &key).unwrap();
        clock.rewind(Duration::from_secs(30));

        let decision = limiter.check_key(Category::ApiRead, &key).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 998);
        assert_eq!(limiter.snapshot().clock_anomalies, 1);
    }

    #[test]
    fn test_snapshot_counts() {
        let (limiter, _) = builtin_limiter();

        for _ in 0..7 {
            limiter.check(Category::Authentication, None, "192.0.2.1").unwrap();
        }
        limiter.check(Category::PublicView, None, "192.0.2.2").unwrap();

        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.tracked_keys, 2);
        assert_eq!(snapshot.blocked_keys, 1);
        assert_eq!(snapshot.total_requests, 8);
        assert_eq!(snapshot.allowed_requests, 6);
        assert_eq!(snapshot.denied_requests, 2);
        assert_eq!(snapshot.categories[&Category::Authentication].denied, 2);
    }

    #[test]
    fn test_reset_stats_keeps_entries() {
        let (limiter, _) = builtin_limiter();
        limiter.check(Category::ApiRead, Some("u1"), "10.0.0.1").unwrap();

        limiter.reset_stats();
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.tracked_keys, 1);
    }

    #[test]
    fn test_take_snapshot_resets_in_one_pass() {
        let (limiter, _) = builtin_limiter();
        limiter.check(Category::ApiRead, Some("u1"), "10.0.0.1").unwrap();
        limiter.check(Category::ApiRead, Some("u1"), "10.0.0.1").unwrap();

        let taken = limiter.take_snapshot();
        assert_eq!(taken.total_requests, 2);
        assert_eq!(taken.tracked_keys, 1);

        limiter.check(Category::ApiRead, Some("u1"), "10.0.0.1").unwrap();
        let after = limiter.snapshot();
        assert_eq!(after.total_requests, 1);
        assert_eq!(after.categories[&Category::ApiRead].requests, 1);
    }

    #[test]
    fn test_oversized_policy_does_not_panic() {
        let table = PolicyTable::empty()
            .with_policy(LimitPolicy::new(
                Category::Authentication,
                1,
                MINUTE,
                Duration::from_secs(u64::MAX),
            ))
            .with_policy(LimitPolicy::new(
                Category::Upload,
                1,
                Duration::from_secs(u64::MAX),
                Duration::ZERO,
            ));
        let (limiter, clock) = limiter_with(table);
        let key = RateLimitKey::Identity("u1".to_string());

        assert!(limiter.check_key(Category::Authentication, &key).unwrap().allowed);
        let locked = limiter.check_key(Category::Authentication, &key).unwrap();
        assert!(!locked.allowed);
        assert!(locked.blocked);

        assert!(limiter.check_key(Category::Upload, &key).unwrap().allowed);
        clock.advance(24 * 60 * MINUTE);
        let denied = limiter.check_key(Category::Upload, &key).unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
    }

    #[test]
    fn test_stale_handle_is_marked_after_eviction() {
        let (limiter, clock) = builtin_limiter();
        let key = RateLimitKey::Address("10.0.0.9".to_string());
        let entry_key = EntryKey::new(Category::ApiRead, key.clone());

        limiter.check_key(Category::ApiRead, &key).unwrap();
        let stale = limiter.entry(&entry_key);
        clock.advance(3 * 60 * MINUTE);

        assert!(limiter.evict_if_expired(&entry_key, 60 * MINUTE));
        assert!(stale.lock().is_evicted());

        let decision = limiter.check_key(Category::ApiRead, &key).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 999);
        assert!(!Arc::ptr_eq(&stale, &limiter.entry(&entry_key)));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_clear_entries() {
        let (limiter, _) = builtin_limiter();
        limiter.check(Category::ApiRead, Some("u1"), "10.0.0.1").unwrap();
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_checks_respect_quota() {
        const CALLERS: usize = 64;
        const QUOTA: u32 = 17;

        let table = PolicyTable::empty().with_policy(LimitPolicy::new(
            Category::ApiDelete,
            QUOTA,
            MINUTE,
            Duration::ZERO,
        ));
        let limiter = Arc::new(RateLimiter::new(table));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // Same identity from many addresses
                    let address = format!("10.0.{}.{}", i / 256, i % 256);
                    limiter
                        .check(Category::ApiDelete, Some("shared"), &address)
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, QUOTA as usize);
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.allowed_requests, QUOTA as u64);
        assert_eq!(snapshot.denied_requests, (CALLERS as u64) - QUOTA as u64);
    }

    #[test]
    fn test_concurrent_checks_on_distinct_keys() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let limiter = Arc::new(RateLimiter::default());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let id = format!("user-{}", i);
                    (0..PER_THREAD)
                        .filter(|_| limiter.check(Category::ApiWrite, Some(&id), "").unwrap().allowed)
                        .count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), PER_THREAD);
        }
        assert_eq!(limiter.tracked_keys(), THREADS);
    }
}
