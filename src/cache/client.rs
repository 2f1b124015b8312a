//! Cache Client Module
//!
//! Routes keys to shards, aggregates their sizes and funnels hit/miss events
//! to the metrics recorder. The refresh-aware read paths live in
//! [`crate::refresh`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;
use xxhash_rust::xxh64::xxh64;

use crate::cache::{CacheOptions, KeyFn, Shard, ShardHit};
use crate::error::{CacheError, Result};
use crate::refresh::{InFlight, InFlightBatch, PassthroughGate, RefreshBuffers};
use crate::tasks::{spawn_eviction_task, EvictionScheduler};

/// Smallest eviction tick period.
const MIN_EVICTION_INTERVAL: Duration = Duration::from_millis(1);

// == Client ==
/// Sharded cache handle. Clones share the same cache.
///
/// Must be created inside a tokio runtime: construction starts the eviction
/// scheduler, which runs until [`Client::stop_evictions`] is called or the
/// last handle is dropped.
pub struct Client<T> {
    pub(crate) inner: Arc<ClientInner<T>>,
}

pub(crate) struct ClientInner<T> {
    pub(crate) ttl: Duration,
    pub(crate) options: Arc<CacheOptions>,
    pub(crate) shards: Arc<[Shard<T>]>,
    pub(crate) gate: PassthroughGate,
    pub(crate) flights: InFlight<T>,
    pub(crate) batch_flights: InFlightBatch<T>,
    pub(crate) buffers: RefreshBuffers<T>,
    scheduler: Mutex<Option<EvictionScheduler>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a cache holding at most `capacity` entries split evenly over
    /// `num_shards` shards.
    ///
    /// Fails with [`CacheError::Config`] when `num_shards` is zero, `ttl` is
    /// zero, `eviction_percentage` exceeds 100, `capacity` is smaller than
    /// `num_shards`, an option is invalid, or no tokio runtime is running.
    pub fn new(
        capacity: usize,
        num_shards: usize,
        ttl: Duration,
        eviction_percentage: u32,
        options: CacheOptions,
    ) -> Result<Self> {
        validate_args(capacity, num_shards, ttl, eviction_percentage)?;
        options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CacheError::Config(
                "the cache must be created inside a tokio runtime".to_string(),
            ));
        }

        // Shards are created after the options are final so they all share
        // the same clock, metrics and refresh settings.
        let options = Arc::new(options);
        let shard_capacity = capacity / num_shards;
        let shards: Arc<[Shard<T>]> = (0..num_shards)
            .map(|_| Shard::new(shard_capacity, ttl, eviction_percentage, Arc::clone(&options)))
            .collect();

        let observed = Arc::downgrade(&shards);
        options.metrics.observe_cache_size(Box::new(move || {
            observed
                .upgrade()
                .map(|shards| shards.iter().map(Shard::size).sum())
                .unwrap_or(0)
        }));

        let interval = options
            .eviction_interval
            .unwrap_or_else(|| ttl / u32::try_from(num_shards).unwrap_or(u32::MAX))
            .max(MIN_EVICTION_INTERVAL);
        let scheduler = spawn_eviction_task(Arc::clone(&shards), Arc::clone(&options), interval);

        info!(
            capacity,
            num_shards,
            ttl_ms = ttl.as_millis() as u64,
            eviction_percentage,
            "cache created"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                ttl,
                gate: PassthroughGate::new(options.passthrough_percentage),
                buffers: RefreshBuffers::new(options.buffering),
                flights: InFlight::new(),
                batch_flights: InFlightBatch::new(),
                options,
                shards,
                scheduler: Mutex::new(Some(scheduler)),
            }),
        })
    }

    // == Routing ==
    /// Returns the index of the shard that owns `key`.
    pub fn shard_index(&self, key: &str) -> usize {
        (xxh64(key.as_bytes(), 0) % self.inner.shards.len() as u64) as usize
    }

    pub(crate) fn get_shard(&self, key: &str) -> &Shard<T> {
        let index = self.shard_index(key);
        self.inner.options.metrics.shard_index(index);
        &self.inner.shards[index]
    }

    pub(crate) fn report_cache_hits(&self, hit: bool) {
        if hit {
            self.inner.options.metrics.cache_hit();
        } else {
            self.inner.options.metrics.cache_miss();
        }
    }

    /// Shard lookup that reports the hit or miss.
    pub(crate) fn get_with_state(&self, key: &str) -> Option<ShardHit<T>> {
        let hit = self.get_shard(key).get(key);
        self.report_cache_hits(hit.is_some());
        hit
    }

    // == Get ==
    /// Returns the cached value for `key`.
    ///
    /// Missing records read as `None`. Never triggers a refresh.
    pub fn get(&self, key: &str) -> Option<T> {
        self.get_with_state(key).and_then(|hit| hit.value)
    }

    /// Returns the cached values for `keys`, keyed by cache key.
    pub fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, T> {
        keys.iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.get(key).map(|value| (key.to_string(), value))
            })
            .collect()
    }

    /// Returns the cached values for `ids`, keyed by id.
    pub fn get_many_key_fn<K: AsRef<str>>(&self, ids: &[K], key_fn: &KeyFn) -> HashMap<String, T> {
        ids.iter()
            .filter_map(|id| {
                let id = id.as_ref();
                self.get(&key_fn(id)).map(|value| (id.to_string(), value))
            })
            .collect()
    }

    // == Set ==
    /// Writes a value. Returns true if the write forced an eviction.
    pub fn set(&self, key: impl Into<String>, value: T) -> bool {
        self.set_record(key.into(), Some(value))
    }

    /// Caches `key` as a record the source confirmed does not exist.
    pub fn store_missing_record(&self, key: impl Into<String>) -> bool {
        self.set_record(key.into(), None)
    }

    /// Writes several values. Returns true if any write forced an eviction.
    pub fn set_many(&self, records: HashMap<String, T>) -> bool {
        records
            .into_iter()
            .fold(false, |evicted, (key, value)| self.set(key, value) || evicted)
    }

    /// Writes several values keyed by id through `key_fn`.
    pub fn set_many_key_fn(&self, records: HashMap<String, T>, key_fn: &KeyFn) -> bool {
        records.into_iter().fold(false, |evicted, (id, value)| {
            self.set(key_fn(&id), value) || evicted
        })
    }

    pub(crate) fn set_record(&self, key: String, value: Option<T>) -> bool {
        let shard = self.get_shard(&key);
        shard.set(key, value)
    }

    // == Delete ==
    /// Removes `key` if present.
    pub fn delete(&self, key: &str) {
        self.get_shard(key).delete(key);
    }

    // == Size ==
    /// Returns the number of entries across all shards.
    ///
    /// Each shard is read under its own lock, so concurrent writes make the
    /// total approximate.
    pub fn size(&self) -> usize {
        self.inner.shards.iter().map(Shard::size).sum()
    }

    /// Returns the number of shards.
    pub fn num_shards(&self) -> usize {
        self.inner.shards.len()
    }

    /// Returns the TTL applied to every entry.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Stops the eviction scheduler. Expired entries are still hidden from
    /// reads but no longer reclaimed.
    pub fn stop_evictions(&self) {
        if let Some(scheduler) = self.inner.scheduler.lock().take() {
            scheduler.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn shard(&self, index: usize) -> &Shard<T> {
        &self.inner.shards[index]
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("ttl", &self.inner.ttl)
            .field("num_shards", &self.inner.shards.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

fn validate_args(
    capacity: usize,
    num_shards: usize,
    ttl: Duration,
    eviction_percentage: u32,
) -> Result<()> {
    if num_shards == 0 {
        return Err(CacheError::Config(
            "num_shards must be greater than 0".to_string(),
        ));
    }
    if ttl.is_zero() {
        return Err(CacheError::Config("ttl must be greater than 0".to_string()));
    }
    if eviction_percentage > 100 {
        return Err(CacheError::Config(format!(
            "eviction_percentage must be between 0 and 100, got {}",
            eviction_percentage
        )));
    }
    if capacity < num_shards {
        return Err(CacheError::Config(format!(
            "capacity ({}) must be at least num_shards ({})",
            capacity, num_shards
        )));
    }
    Ok(())
}
