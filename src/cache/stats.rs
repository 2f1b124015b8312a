//! Cache Statistics Module
//!
//! Atomic-counter metrics recorder and the serializable snapshot it produces.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::{MetricsRecorder, SizeFn};

// == Cache Stats ==
/// Point-in-time view of the recorded metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of eviction scheduler ticks
    pub evictions: u64,
    /// Number of times a full shard had to evict early
    pub forced_evictions: u64,
    /// Total number of entries removed by eviction passes
    pub entries_evicted: u64,
    /// Number of dispatched refresh batches
    pub batch_refreshes: u64,
    /// Total number of ids across dispatched refresh batches
    pub batch_refresh_ids: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Metrics recorder keeping lock-free counters.
#[derive(Default)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    forced_evictions: AtomicU64,
    entries_evicted: AtomicU64,
    batch_refreshes: AtomicU64,
    batch_refresh_ids: AtomicU64,
    size: Mutex<Option<SizeFn>>,
}

impl StatsRecorder {
    /// Creates a recorder with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counters and cache size.
    pub fn snapshot(&self) -> CacheStats {
        let total_entries = self.size.lock().as_ref().map(|size| size()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            forced_evictions: self.forced_evictions.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            batch_refreshes: self.batch_refreshes.load(Ordering::Relaxed),
            batch_refresh_ids: self.batch_refresh_ids.load(Ordering::Relaxed),
            total_entries,
        }
    }
}

impl MetricsRecorder for StatsRecorder {
    fn cache_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn forced_eviction(&self) {
        self.forced_evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn entries_evicted(&self, count: usize) {
        self.entries_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn cache_batch_refresh_size(&self, size: usize) {
        self.batch_refreshes.fetch_add(1, Ordering::Relaxed);
        self.batch_refresh_ids
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    fn observe_cache_size(&self, callback: SizeFn) {
        *self.size.lock() = Some(callback);
    }
}

impl std::fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("stats", &self.snapshot())
            .finish()
    }
}
