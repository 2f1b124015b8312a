//! Shard Module
//!
//! An independently locked, capacity-bounded slice of the key space.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::cache::clock::{deadline, to_delta};
use crate::cache::eviction::{eviction_count, select_victims};
use crate::cache::{CacheEntry, CacheOptions};

/// Largest backoff exponent applied to `retry_base_delay`.
const MAX_RETRY_SHIFT: u32 = 16;

// == Shard Hit ==
/// Result of a successful shard lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardHit<T> {
    /// The cached value, None for a missing record
    pub value: Option<T>,
    /// True if this read claimed the entry's next background refresh
    pub should_refresh: bool,
}

impl<T> ShardHit<T> {
    /// Returns true if the entry is a cached "not found" result.
    pub fn is_missing_record(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug)]
struct ShardMap<T> {
    entries: HashMap<String, CacheEntry<T>>,
    next_seq: u64,
}

// == Shard ==
/// Bounded entry store guarded by its own lock.
pub struct Shard<T> {
    capacity: usize,
    ttl: Duration,
    eviction_percentage: u32,
    map: RwLock<ShardMap<T>>,
    options: Arc<CacheOptions>,
}

impl<T: Clone> Shard<T> {
    // == Constructor ==
    /// Creates an empty shard holding at most `capacity` entries.
    pub fn new(
        capacity: usize,
        ttl: Duration,
        eviction_percentage: u32,
        options: Arc<CacheOptions>,
    ) -> Self {
        Self {
            capacity,
            ttl,
            eviction_percentage,
            map: RwLock::new(ShardMap {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            options,
        }
    }

    // == Get ==
    /// Looks up a live entry.
    ///
    /// Expired entries that the scheduler has not swept yet are reported as
    /// absent. When the entry is due for a refresh, the first reader to see
    /// it pushes the next refresh time back by an exponential backoff and
    /// gets `should_refresh = true`; concurrent readers do not.
    pub fn get(&self, key: &str) -> Option<ShardHit<T>> {
        let now = self.options.clock.now();
        {
            let map = self.map.read();
            let entry = map.entries.get(key)?;
            if entry.is_expired(now) {
                return None;
            }
            if !entry.is_refresh_due(now) {
                return Some(ShardHit {
                    value: entry.value.clone(),
                    should_refresh: false,
                });
            }
        }

        // Another reader may claim the refresh while we switch locks.
        let mut map = self.map.write();
        let entry = map.entries.get_mut(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let should_refresh = entry.is_refresh_due(now);
        if should_refresh {
            if let Some(refreshes) = &self.options.refreshes {
                let shift = entry.refresh_retries.min(MAX_RETRY_SHIFT);
                let backoff = refreshes.retry_base_delay.saturating_mul(1 << shift);
                entry.refresh_at = Some(deadline(now, backoff));
                entry.refresh_retries += 1;
            }
        }
        Some(ShardHit {
            value: entry.value.clone(),
            should_refresh,
        })
    }

    /// Reads a live value without touching its refresh schedule.
    pub fn peek(&self, key: &str) -> Option<T> {
        let now = self.options.clock.now();
        let map = self.map.read();
        map.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.value.clone())
    }

    // == Set ==
    /// Inserts or overwrites an entry. `None` stores a missing record.
    ///
    /// Inserting a new key into a full shard first evicts
    /// `eviction_percentage` of its entries, soonest-expiring first. If the
    /// shard is still full afterwards (a zero percentage) the write is
    /// dropped. Returns true if a forced eviction ran.
    pub fn set(&self, key: String, value: Option<T>) -> bool {
        let now = self.options.clock.now();
        let refresh_at = self.next_refresh_at(now);

        let mut map = self.map.write();
        let is_overwrite = map.entries.contains_key(&key);

        let evicted = !is_overwrite && map.entries.len() >= self.capacity;
        if evicted {
            self.force_evict(&mut map);
        }

        if !is_overwrite && map.entries.len() >= self.capacity {
            debug!(key = %key, "shard still full after forced eviction, dropping write");
            return evicted;
        }

        let seq = map.next_seq;
        map.next_seq += 1;
        let entry = CacheEntry::new(value, now, to_delta(self.ttl), refresh_at, seq);
        map.entries.insert(key, entry);

        evicted
    }

    // == Delete ==
    /// Removes an entry if present.
    pub fn delete(&self, key: &str) {
        self.map.write().entries.remove(key);
    }

    // == Evict Expired ==
    /// Removes every expired entry and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.options.clock.now();
        let removed = {
            let mut map = self.map.write();
            let before = map.entries.len();
            map.entries.retain(|_, entry| !entry.is_expired(now));
            before - map.entries.len()
        };

        if removed > 0 {
            self.options.metrics.entries_evicted(removed);
        }
        removed
    }

    // == Size ==
    /// Returns the current number of entries.
    pub fn size(&self) -> usize {
        self.map.read().entries.len()
    }

    /// Returns the maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn force_evict(&self, map: &mut ShardMap<T>) {
        self.options.metrics.forced_eviction();

        let count = eviction_count(map.entries.len(), self.eviction_percentage);
        if count >= map.entries.len() {
            map.entries.clear();
        } else {
            for key in select_victims(&map.entries, count) {
                map.entries.remove(&key);
            }
        }

        debug!(
            evicted = count,
            remaining = map.entries.len(),
            "forced eviction on full shard"
        );
        self.options.metrics.entries_evicted(count);
    }

    fn next_refresh_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let refreshes = self.options.refreshes.as_ref()?;
        let spread = refreshes
            .max_refresh_time
            .saturating_sub(refreshes.min_refresh_time);
        let padding = if spread.is_zero() {
            Duration::ZERO
        } else {
            let nanos = u64::try_from(spread.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
        };
        Some(deadline(now, refreshes.min_refresh_time.saturating_add(padding)))
    }
}

impl<T> std::fmt::Debug for Shard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("eviction_percentage", &self.eviction_percentage)
            .field("size", &self.map.read().entries.len())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MetricsRecorder, StatsRecorder, TestClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: TestClock,
        stats: Arc<StatsRecorder>,
        shard: Shard<String>,
    }

    fn fixture(capacity: usize, eviction_percentage: u32, options: CacheOptions) -> Fixture {
        let clock = TestClock::default();
        let stats = Arc::new(StatsRecorder::new());
        let options = options
            .with_clock(Arc::new(clock.clone()))
            .with_metrics(stats.clone());
        let shard = Shard::new(
            capacity,
            Duration::from_secs(1),
            eviction_percentage,
            Arc::new(options),
        );
        Fixture {
            clock,
            stats,
            shard,
        }
    }

    fn value(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_shard_set_and_get() {
        let f = fixture(10, 50, CacheOptions::new());

        assert!(!f.shard.set("key1".to_string(), value("value1")));
        let hit = f.shard.get("key1").unwrap();

        assert_eq!(hit.value, value("value1"));
        assert!(!hit.should_refresh);
        assert_eq!(f.shard.size(), 1);
    }

    #[test]
    fn test_shard_get_nonexistent() {
        let f = fixture(10, 50, CacheOptions::new());
        assert!(f.shard.get("nonexistent").is_none());
    }

    #[test]
    fn test_shard_delete() {
        let f = fixture(10, 50, CacheOptions::new());

        f.shard.set("key1".to_string(), value("value1"));
        f.shard.delete("key1");
        f.shard.delete("never-set");

        assert_eq!(f.shard.size(), 0);
        assert!(f.shard.get("key1").is_none());
    }

    #[test]
    fn test_shard_overwrite_does_not_evict() {
        let f = fixture(2, 50, CacheOptions::new());

        f.shard.set("a".to_string(), value("1"));
        f.shard.set("b".to_string(), value("2"));
        assert!(!f.shard.set("a".to_string(), value("3")));

        assert_eq!(f.shard.size(), 2);
        assert_eq!(f.shard.get("a").unwrap().value, value("3"));
        assert_eq!(f.stats.snapshot().forced_evictions, 0);
    }

    #[test]
    fn test_expired_entry_is_invisible_before_sweep() {
        let f = fixture(10, 50, CacheOptions::new());

        f.shard.set("key1".to_string(), value("value1"));
        f.clock.add(Duration::from_secs(1));

        assert!(f.shard.get("key1").is_none());
        assert_eq!(f.shard.size(), 1);
    }

    #[test]
    fn test_evict_expired() {
        let f = fixture(10, 50, CacheOptions::new());

        f.shard.set("old".to_string(), value("1"));
        f.clock.add(Duration::from_millis(600));
        f.shard.set("new".to_string(), value("2"));
        f.clock.add(Duration::from_millis(600));

        assert_eq!(f.shard.evict_expired(), 1);
        assert_eq!(f.shard.size(), 1);
        assert!(f.shard.get("new").is_some());
        assert_eq!(f.stats.snapshot().entries_evicted, 1);
    }

    #[derive(Default)]
    struct SweepReports {
        reports: AtomicUsize,
    }

    impl MetricsRecorder for SweepReports {
        fn entries_evicted(&self, _count: usize) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_idle_sweep_reports_nothing() {
        let clock = TestClock::default();
        let recorder = Arc::new(SweepReports::default());
        let options = CacheOptions::new()
            .with_clock(Arc::new(clock.clone()))
            .with_metrics(recorder.clone());
        let shard = Shard::new(10, Duration::from_secs(1), 50, Arc::new(options));

        shard.set("live".to_string(), value("1"));
        assert_eq!(shard.evict_expired(), 0);
        assert_eq!(recorder.reports.load(Ordering::SeqCst), 0);

        clock.add(Duration::from_secs(2));
        assert_eq!(shard.evict_expired(), 1);
        assert_eq!(recorder.reports.load(Ordering::SeqCst), 1);
    }


    #[test]
    fn test_forced_eviction_on_full_shard() {
        let f = fixture(5, 50, CacheOptions::new());

        for i in 0..5 {
            assert!(!f.shard.set(format!("key{}", i), value("v")));
            f.clock.add(Duration::from_millis(10));
        }
        assert!(f.shard.set("key5".to_string(), value("v")));

        // 50% of 5 rounds down to 2, then the new entry is added
        assert_eq!(f.shard.size(), 4);
        assert!(f.shard.get("key0").is_none());
        assert!(f.shard.get("key1").is_none());
        assert!(f.shard.get("key5").is_some());

        let stats = f.stats.snapshot();
        assert_eq!(stats.forced_evictions, 1);
        assert_eq!(stats.entries_evicted, 2);
    }

    #[test]
    fn test_forced_eviction_ties_use_insertion_order() {
        let f = fixture(3, 34, CacheOptions::new());

        f.shard.set("first".to_string(), value("1"));
        f.shard.set("second".to_string(), value("2"));
        f.shard.set("third".to_string(), value("3"));
        f.shard.set("fourth".to_string(), value("4"));

        assert!(f.shard.get("first").is_none());
        assert!(f.shard.get("second").is_some());
        assert!(f.shard.get("fourth").is_some());
    }

    #[test]
    fn test_zero_eviction_percentage_drops_write() {
        let f = fixture(2, 0, CacheOptions::new());

        f.shard.set("a".to_string(), value("1"));
        f.shard.set("b".to_string(), value("2"));
        assert!(f.shard.set("c".to_string(), value("3")));

        assert_eq!(f.shard.size(), 2);
        assert!(f.shard.get("c").is_none());
    }

    #[test]
    fn test_missing_record_is_a_hit() {
        let f = fixture(10, 50, CacheOptions::new());

        f.shard.set("gone".to_string(), None);
        let hit = f.shard.get("gone").unwrap();

        assert!(hit.is_missing_record());
    }

    #[test]
    fn test_refresh_claimed_once_with_backoff() {
        let options = CacheOptions::new().with_background_refreshes(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        let f = fixture(10, 50, options);

        f.shard.set("key".to_string(), value("v"));
        assert!(!f.shard.get("key").unwrap().should_refresh);

        f.clock.add(Duration::from_millis(100));
        assert!(f.shard.get("key").unwrap().should_refresh);
        assert!(!f.shard.get("key").unwrap().should_refresh);

        // First retry becomes due after the base delay
        f.clock.add(Duration::from_millis(50));
        assert!(f.shard.get("key").unwrap().should_refresh);

        // Second retry waits twice as long
        f.clock.add(Duration::from_millis(50));
        assert!(!f.shard.get("key").unwrap().should_refresh);
        f.clock.add(Duration::from_millis(50));
        assert!(f.shard.get("key").unwrap().should_refresh);
    }
}
