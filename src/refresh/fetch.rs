//! Fetch Module
//!
//! The read-through paths: serve from the cache when possible, claim
//! background refreshes for stale entries and share one source call between
//! concurrent misses.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{Client, KeyFn};
use crate::error::{BatchError, CacheError, Result};
use crate::refresh::inflight::{collect_tickets, BatchFlight, Flight};
use crate::refresh::{BatchFetchFn, BoxFuture, FetchFn};

/// Runs a fetch in its own task so a panic becomes an error.
pub(crate) async fn run_isolated<V: Send + 'static>(fetch: BoxFuture<Result<V>>) -> Result<V> {
    match tokio::spawn(fetch).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(CacheError::Internal("fetch panicked".to_string())),
        Err(err) => Err(CacheError::Internal(format!("fetch task failed: {}", err))),
    }
}

/// Ids of one batch read, split by what the cache could do for them.
struct Grouped<T> {
    cached: HashMap<String, T>,
    misses: Vec<String>,
    refreshes: Vec<String>,
}

impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    // == Get Or Fetch ==
    /// Returns the cached value for `key`, fetching it on a miss.
    ///
    /// Concurrent misses for the same key share one call to `fetch`. A stale
    /// hit returns immediately and refreshes the entry in the background.
    /// Fails with [`CacheError::MissingRecord`] when the key is cached as
    /// missing.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetch: FetchFn<T> = Arc::new(move || -> BoxFuture<Result<T>> { Box::pin(fetch()) });

        if !self.inner.gate.use_cache() {
            return self.passthrough(key, &fetch).await;
        }

        if let Some(hit) = self.get_with_state(key) {
            if hit.should_refresh {
                self.refresh(key.to_string(), fetch);
            }
            return hit.value.ok_or(CacheError::MissingRecord);
        }

        self.call_and_cache(key, fetch).await
    }

    async fn call_and_cache(&self, key: &str, fetch: FetchFn<T>) -> Result<T> {
        let (flight, leader) = self.inner.flights.join_or_start(key);
        if leader {
            tokio::spawn(self.clone().run_flight(key.to_string(), fetch, Arc::clone(&flight)));
        }
        flight.wait().await
    }

    /// Starts a background refresh unless one is already running for `key`.
    fn refresh(&self, key: String, fetch: FetchFn<T>) {
        match self.inner.flights.try_start(&key) {
            Some(flight) => {
                debug!(key = %key, "Refreshing entry in the background");
                tokio::spawn(self.clone().run_flight(key, fetch, flight));
            }
            None => debug!(key = %key, "Refresh already in flight"),
        }
    }

    async fn run_flight(self, key: String, fetch: FetchFn<T>, flight: Arc<Flight<T>>) {
        let result = match run_isolated(fetch()).await {
            Ok(value) => {
                self.set(key.clone(), value.clone());
                Ok(value)
            }
            Err(CacheError::NotFound) => self.record_not_found(&key),
            Err(err) => {
                warn!(key = %key, error = %err, "Fetch failed");
                Err(err)
            }
        };

        flight.complete(result);
        self.inner.flights.finish(&key);
    }

    /// Applies a "not found" outcome to `key` and returns the error the
    /// caller should see.
    fn record_not_found(&self, key: &str) -> Result<T> {
        if self.inner.options.store_misses {
            self.store_missing_record(key);
            Err(CacheError::MissingRecord)
        } else {
            self.delete(key);
            Err(CacheError::NotFound)
        }
    }

    // == Get Or Fetch Batch ==
    /// Returns the records for `ids`, keyed by id, fetching the ones the
    /// cache does not hold with a single call to `fetch`.
    ///
    /// Ids the source leaves out of its response are treated as not found.
    /// Ids cached as missing are left out of the result. When the source
    /// fails, the error carries every record that could still be returned.
    pub async fn get_or_fetch_batch<K, F, Fut>(
        &self,
        ids: &[K],
        key_fn: &KeyFn,
        fetch: F,
    ) -> std::result::Result<HashMap<String, T>, BatchError<T>>
    where
        K: AsRef<str>,
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<String, T>>> + Send + 'static,
    {
        let fetch: BatchFetchFn<T> = Arc::new(
            move |ids: Vec<String>| -> BoxFuture<Result<HashMap<String, T>>> {
                Box::pin(fetch(ids))
            },
        );
        let ids = dedupe(ids);

        if !self.inner.gate.use_cache() {
            return self.passthrough_batch(ids, key_fn, &fetch).await;
        }

        let Grouped {
            mut cached,
            misses,
            refreshes,
        } = self.group_ids(&ids, key_fn);

        if !refreshes.is_empty() {
            self.refresh_batch(refreshes, key_fn, &fetch);
        }
        if misses.is_empty() {
            return Ok(cached);
        }

        let (fetched, error) = self.call_and_cache_batch(&misses, key_fn, fetch).await;
        cached.extend(fetched);
        match error {
            None => Ok(cached),
            Some(error) => Err(BatchError { cached, error }),
        }
    }

    fn group_ids(&self, ids: &[String], key_fn: &KeyFn) -> Grouped<T> {
        let mut grouped = Grouped {
            cached: HashMap::new(),
            misses: Vec::new(),
            refreshes: Vec::new(),
        };

        for id in ids {
            let Some(hit) = self.get_with_state(&key_fn(id)) else {
                grouped.misses.push(id.clone());
                continue;
            };
            if hit.should_refresh {
                grouped.refreshes.push(id.clone());
            }
            if let Some(value) = hit.value {
                grouped.cached.insert(id.clone(), value);
            }
        }

        grouped
    }

    async fn call_and_cache_batch(
        &self,
        ids: &[String],
        key_fn: &KeyFn,
        fetch: BatchFetchFn<T>,
    ) -> (HashMap<String, T>, Option<CacheError>) {
        let plan = self.inner.batch_flights.plan(ids, key_fn);
        let mut tickets = plan.joined;

        if let Some((flight, ids)) = plan.started {
            tokio::spawn(self.clone().run_batch_flight(
                ids.clone(),
                key_fn.clone(),
                fetch,
                Arc::clone(&flight),
            ));
            tickets.push((flight, ids));
        }

        collect_tickets(tickets).await
    }

    /// Refreshes stale ids, through the buffers when buffering is on.
    fn refresh_batch(&self, ids: Vec<String>, key_fn: &KeyFn, fetch: &BatchFetchFn<T>) {
        if self.inner.options.buffering.is_some() {
            // Nobody waits on the tickets: the records land in the shards.
            self.inner
                .buffers
                .submit(self, ids, key_fn.clone(), fetch.clone(), true);
            return;
        }

        let plan = self.inner.batch_flights.plan(&ids, key_fn);
        if let Some((flight, ids)) = plan.started {
            self.inner.options.metrics.cache_batch_refresh_size(ids.len());
            debug!(ids = ids.len(), "Refreshing batch in the background");
            tokio::spawn(self.clone().run_batch_flight(
                ids,
                key_fn.clone(),
                fetch.clone(),
                flight,
            ));
        }
    }

    async fn run_batch_flight(
        self,
        ids: Vec<String>,
        key_fn: KeyFn,
        fetch: BatchFetchFn<T>,
        flight: Arc<BatchFlight<T>>,
    ) {
        let result = match run_isolated(fetch(ids.clone())).await {
            Ok(records) => {
                self.store_batch_response(&ids, &key_fn, &records);
                Ok(Arc::new(records))
            }
            Err(err) => {
                warn!(ids = ids.len(), error = %err, "Batch fetch failed");
                Err(err)
            }
        };

        let keys: Vec<String> = ids.iter().map(|id| key_fn(id)).collect();
        flight.complete(result);
        self.inner.batch_flights.finish(&keys, &flight);
    }

    /// Writes a batch response to the shards. Requested ids the source left
    /// out are handled as "not found".
    pub(crate) fn store_batch_response(
        &self,
        ids: &[String],
        key_fn: &KeyFn,
        records: &HashMap<String, T>,
    ) {
        for (id, value) in records {
            self.set(key_fn(id), value.clone());
        }
        for id in ids.iter().filter(|id| !records.contains_key(*id)) {
            // The error only matters to a waiting caller
            let _ = self.record_not_found(&key_fn(id));
        }
    }
}

fn dedupe<K: AsRef<str>>(ids: &[K]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .map(|id| id.as_ref())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}
