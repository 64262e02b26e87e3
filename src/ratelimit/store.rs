//! Concurrent, bounded store of window counters.
//!
//! Counters live in a sharded `DashMap`, each behind its own mutex. Shard
//! locks are only held long enough to clone an `Arc` out of the map (or to
//! insert a new one), so check-and-increment on one key never blocks
//! another key.
//!
//! Eviction is amortized onto callers rather than run on a thread:
//! - an entry found idle on access is replaced by a fresh counter,
//! - at most once per sweep interval, one caller removes every idle entry,
//! - inserting past capacity evicts the least recently used entries.
//!
//! An entry evicted while another request still holds it keeps working for
//! that request; the update is simply not seen by later requests. At worst
//! this admits one extra request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::counter::{AcquireResult, WindowCounter};
use super::key::CompositeKey;
use crate::config::RateLimitingConfig;

/// Floor on sweep spacing; a full sweep takes every shard's write lock.
const MIN_SWEEP_INTERVAL_MILLIS: u64 = 1_000;

/// A stored counter plus its last access time.
#[derive(Debug)]
struct Slot {
    counter: Mutex<WindowCounter>,
    last_access_millis: AtomicU64,
}

impl Slot {
    fn new(now_millis: u64) -> Self {
        Self {
            counter: Mutex::new(WindowCounter::new(now_millis)),
            last_access_millis: AtomicU64::new(now_millis),
        }
    }

    fn last_access(&self) -> u64 {
        self.last_access_millis.load(Ordering::Acquire)
    }

    fn touch(&self, now_millis: u64) {
        self.last_access_millis.fetch_max(now_millis, Ordering::AcqRel);
    }

    fn is_idle(&self, now_millis: u64, idle_timeout_millis: u64) -> bool {
        now_millis.saturating_sub(self.last_access()) >= idle_timeout_millis
    }
}

/// Short-lived access to one key's counter.
///
/// Obtained per request from [`CounterStore::get_or_create`]; callers must
/// not keep it across requests.
#[derive(Debug, Clone)]
pub struct CounterHandle {
    slot: Arc<Slot>,
}

impl CounterHandle {
    /// Run the fixed-window check-and-increment under this key's lock.
    pub fn try_acquire(&self, now_millis: u64, limit: u64, window_seconds: u64) -> AcquireResult {
        self.slot.counter.lock().try_acquire(now_millis, limit, window_seconds)
    }

    /// Count in the window current at `now_millis`, without incrementing.
    pub fn current_count(&self, now_millis: u64, window_seconds: u64) -> u64 {
        self.slot.counter.lock().current_count(now_millis, window_seconds)
    }
}

/// Map from [`CompositeKey`] to counters with idle and capacity eviction.
#[derive(Debug)]
pub struct CounterStore {
    slots: DashMap<CompositeKey, Arc<Slot>>,
    idle_timeout_millis: u64,
    max_entries: usize,
    sweep_interval_millis: u64,
    last_sweep_millis: AtomicU64,
}

impl CounterStore {
    /// Create a store. `max_entries` is clamped to at least one and
    /// `sweep_interval` to at least one second.
    pub fn new(idle_timeout: Duration, max_entries: usize, sweep_interval: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            idle_timeout_millis: duration_millis(idle_timeout),
            max_entries: max_entries.max(1),
            sweep_interval_millis: duration_millis(sweep_interval)
                .max(MIN_SWEEP_INTERVAL_MILLIS),
            last_sweep_millis: AtomicU64::new(0),
        }
    }

    /// Create a store from the rate limiting settings.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(
            config.idle_timeout(),
            config.max_entries,
            config.sweep_interval(),
        )
    }

    /// Get the counter for `key`, creating it if absent or idle-expired.
    ///
    /// Concurrent first requests for the same key always get the same
    /// counter.
    pub fn get_or_create(&self, key: &CompositeKey, now_millis: u64) -> CounterHandle {
        self.maybe_sweep(now_millis);

        // Fast path: shard read lock only
        if let Some(slot) = self.slots.get(key) {
            if !slot.is_idle(now_millis, self.idle_timeout_millis) {
                slot.touch(now_millis);
                return CounterHandle { slot: Arc::clone(slot.value()) };
            }
        }

        let (slot, inserted) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                // Re-check under the shard write lock; another caller may
                // already have replaced the idle entry.
                if occupied.get().is_idle(now_millis, self.idle_timeout_millis) {
                    debug!(key = %key, "Replacing idle rate limit counter");
                    occupied.insert(Arc::new(Slot::new(now_millis)));
                } else {
                    occupied.get().touch(now_millis);
                }
                (Arc::clone(occupied.get()), false)
            }
            Entry::Vacant(vacant) => {
                debug!(key = %key, "Creating new rate limit counter");
                let slot = Arc::new(Slot::new(now_millis));
                vacant.insert(Arc::clone(&slot));
                (slot, true)
            }
        };

        // The entry guard above is dropped before touching other shards.
        if inserted && self.slots.len() > self.max_entries {
            self.evict_overflow(key);
        }

        CounterHandle { slot }
    }

    /// Current count for `key` without creating or touching it.
    pub fn peek(&self, key: &CompositeKey, now_millis: u64, window_seconds: u64) -> Option<u64> {
        let slot = self.slots.get(key).map(|slot| Arc::clone(slot.value()))?;
        if slot.is_idle(now_millis, self.idle_timeout_millis) {
            return Some(0);
        }
        let count = CounterHandle { slot }.current_count(now_millis, window_seconds);
        Some(count)
    }

    /// Remove every entry idle at `now_millis`. Returns how many were removed.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let before = self.slots.len();
        let idle_timeout = self.idle_timeout_millis;
        self.slots.retain(|_, slot| !slot.is_idle(now_millis, idle_timeout));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.slots.len(),
                "Swept idle rate limit counters"
            );
        }
        removed
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_millis)
    }

    /// Run a sweep if the interval has passed; one caller wins the race.
    fn maybe_sweep(&self, now_millis: u64) {
        let last = self.last_sweep_millis.load(Ordering::Acquire);
        if now_millis.saturating_sub(last) < self.sweep_interval_millis {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now_millis, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.sweep(now_millis);
        }
    }

    /// Evict least recently used entries until back under capacity, plus a
    /// batch of headroom so a full store does not rescan on every insert.
    fn evict_overflow(&self, just_inserted: &CompositeKey) {
        let overflow = self.slots.len().saturating_sub(self.max_entries);
        if overflow == 0 {
            return;
        }
        let batch = overflow + self.max_entries / 16;

        let mut candidates: Vec<(u64, CompositeKey)> = self
            .slots
            .iter()
            .filter(|entry| entry.key() != just_inserted)
            .map(|entry| (entry.value().last_access(), entry.key().clone()))
            .collect();
        candidates.sort_unstable_by_key(|(last_access, _)| *last_access);

        let mut evicted = 0;
        for (seen, key) in candidates.into_iter().take(batch) {
            // Skip entries touched since the scan
            if self
                .slots
                .remove_if(&key, |_, slot| slot.last_access() == seen)
                .is_some()
            {
                evicted += 1;
            }
        }
        debug!(
            evicted = evicted,
            remaining = self.slots.len(),
            max_entries = self.max_entries,
            "Evicted rate limit counters over capacity"
        );
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(caller: &str) -> CompositeKey {
        CompositeKey::new(caller, "GET", "/v1/geocode")
    }

    fn store(max_entries: usize) -> CounterStore {
        CounterStore::new(Duration::from_secs(600), max_entries, Duration::from_secs(60))
    }

    #[test]
    fn test_same_key_same_counter() {
        let store = store(100);
        let first = store.get_or_create(&key("s1"), 0);
        assert!(first.try_acquire(0, 2, 60).is_allowed());

        let second = store.get_or_create(&key("s1"), 10);
        assert!(second.try_acquire(10, 2, 60).is_allowed());
        assert!(!second.try_acquire(10, 2, 60).is_allowed());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_keys_distinct_counters() {
        let store = store(100);
        let a = store.get_or_create(&key("s1"), 0);
        let b = store.get_or_create(&key("s2"), 0);
        assert!(a.try_acquire(0, 1, 60).is_allowed());
        assert!(b.try_acquire(0, 1, 60).is_allowed());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_idle_entry_replaced_on_access() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::from_secs(3600));
        let handle = store.get_or_create(&key("s1"), 0);
        assert!(handle.try_acquire(0, 1, 3600).is_allowed());
        assert_eq!(store.peek(&key("s1"), 5_000, 3600), Some(1));

        // Still inside the rule window, but idle long enough to be forgotten
        let handle = store.get_or_create(&key("s1"), 10_000);
        assert!(handle.try_acquire(10_000, 1, 3600).is_allowed());
    }

    #[test]
    fn test_access_keeps_entry_alive() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::from_secs(3600));
        let handle = store.get_or_create(&key("s1"), 0);
        assert!(handle.try_acquire(0, 1, 3600).is_allowed());

        store.get_or_create(&key("s1"), 8_000);
        let handle = store.get_or_create(&key("s1"), 16_000);
        assert!(!handle.try_acquire(16_000, 1, 3600).is_allowed());
    }

    #[test]
    fn test_sweep_removes_idle_entries() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::from_secs(3600));
        store.get_or_create(&key("old"), 0);
        store.get_or_create(&key("new"), 9_000);

        assert_eq!(store.sweep(10_000), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek(&key("old"), 10_000, 60), None);
        assert_eq!(store.peek(&key("new"), 10_000, 60), Some(0));
    }

    #[test]
    fn test_amortized_sweep_runs_on_access() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::from_secs(30));
        store.get_or_create(&key("a"), 0);
        store.get_or_create(&key("b"), 0);
        assert_eq!(store.len(), 2);

        // Past both the idle timeout and the sweep interval
        store.get_or_create(&key("c"), 40_000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let store = store(4);
        for (i, caller) in ["a", "b", "c", "d"].iter().enumerate() {
            store.get_or_create(&key(caller), i as u64);
        }
        // Refresh "a" so "b" is now the oldest
        store.get_or_create(&key("a"), 10);

        store.get_or_create(&key("e"), 11);
        assert_eq!(store.len(), 4);
        assert_eq!(store.peek(&key("b"), 11, 60), None);
        assert!(store.peek(&key("a"), 11, 60).is_some());
        assert!(store.peek(&key("e"), 11, 60).is_some());
    }

    #[test]
    fn test_capacity_never_evicts_new_entry() {
        let store = store(1);
        store.get_or_create(&key("a"), 100);
        store.get_or_create(&key("b"), 0);
        assert_eq!(store.len(), 1);
        assert!(store.peek(&key("b"), 0, 60).is_some());
    }

    #[test]
    fn test_concurrent_first_requests_share_counter() {
        use std::sync::Barrier;

        let store = store(100);
        let threads = 16;
        let barrier = Barrier::new(threads);
        let allowed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    let handle = store.get_or_create(&key("racer"), 0);
                    if handle.try_acquire(0, 1, 60).is_allowed() {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::ZERO);
        store.get_or_create(&key("a"), 0);
        // Sweeps at 9.5s while "a" is not idle yet
        store.get_or_create(&key("b"), 9_500);

        // "a" is idle now, but this is inside the one-second floor
        store.get_or_create(&key("b"), 10_200);
        assert_eq!(store.len(), 2);

        store.get_or_create(&key("b"), 10_500);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evicted_handle_still_counts() {
        let store = store(100);
        let held = store.get_or_create(&key("s1"), 0);

        store.clear();
        assert!(store.is_empty());

        // The in-flight holder keeps a consistent counter of its own
        assert_eq!(held.try_acquire(0, 1, 60), AcquireResult::Allowed);
        assert_eq!(
            held.try_acquire(0, 1, 60),
            AcquireResult::Denied { retry_after_seconds: 60 }
        );
        assert_eq!(held.current_count(0, 60), 1);

        // Later requests start from a fresh counter
        let fresh = store.get_or_create(&key("s1"), 0);
        assert_eq!(fresh.try_acquire(0, 1, 60), AcquireResult::Allowed);
        assert_eq!(store.peek(&key("s1"), 0, 60), Some(1));
    }

    #[test]
    fn test_evicted_by_sweep_while_held() {
        let store = CounterStore::new(Duration::from_secs(10), 100, Duration::from_secs(3600));
        let held = store.get_or_create(&key("s1"), 0);

        assert_eq!(store.sweep(10_000), 1);
        assert!(held.try_acquire(10_000, 2, 60).is_allowed());
        assert_eq!(held.current_count(10_000, 60), 1);
        assert_eq!(store.peek(&key("s1"), 10_000, 60), None);
    }

    #[test]
    fn test_busy_key_does_not_block_other_keys() {
        use std::sync::mpsc;

        let store = store(100);
        let busy = store.get_or_create(&key("busy"), 0);
        let holder = busy.clone();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                let _guard = holder.slot.counter.lock();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });

            locked_rx.recv().unwrap();
            // "busy" is locked by the other thread for this whole block
            let other = store.get_or_create(&key("other"), 0);
            assert!(other.try_acquire(0, 1, 60).is_allowed());
            assert!(store.peek(&key("other"), 0, 60).is_some());
            release_tx.send(()).unwrap();
        });

        assert!(busy.try_acquire(0, 1, 60).is_allowed());
    }

    #[test]
    fn test_clear() {
        let store = store(100);
        store.get_or_create(&key("a"), 0);
        assert!(!store.is_empty());
        store.clear();
        assert!(store.is_empty());
    }
}
