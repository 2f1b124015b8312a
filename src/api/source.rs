//! Record Source
//!
//! Simulated slow backing store the demo server puts the cache in front of.
//! Every call sleeps for the configured latency and is counted, so the effect
//! of deduplication and batching is visible on `/stats`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CacheError, Result};

/// In-memory record store with artificial latency.
#[derive(Debug)]
pub struct RecordSource {
    records: RwLock<HashMap<String, String>>,
    latency: Duration,
    calls: AtomicU64,
}

impl RecordSource {
    /// Creates an empty source answering after `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            latency,
            calls: AtomicU64::new(0),
        }
    }

    /// Creates a source preloaded with `count` records `"1"..="count"`.
    pub fn with_records(latency: Duration, count: usize) -> Self {
        let source = Self::new(latency);
        {
            let mut records = source.records.write();
            for id in 1..=count {
                records.insert(id.to_string(), format!("record-{}", id));
            }
        }
        source
    }

    /// Fetches one record. Fails with [`CacheError::NotFound`] if absent.
    pub async fn fetch(&self, id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        debug!(id = %id, "Source fetch");
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    /// Fetches several records with one call. Unknown ids are left out.
    pub async fn fetch_batch(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        debug!(ids = ids.len(), "Source batch fetch");
        let records = self.records.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|value| (id.clone(), value.clone())))
            .collect())
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, id: impl Into<String>, value: impl Into<String>) {
        self.records.write().insert(id.into(), value.into());
    }

    /// Removes a record. Returns true if it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.records.write().remove(id).is_some()
    }

    /// Returns the number of fetch calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}
