//! Passthrough Module
//!
//! Lets a share of reads skip the cache and go straight to the source, so a
//! cache can be rolled out (or drained) gradually. Bypassed results are never
//! written back.

use std::collections::HashMap;

use rand::Rng;
use tracing::debug;

use crate::cache::{Client, KeyFn};
use crate::error::{BatchError, Result};
use crate::refresh::fetch::run_isolated;
use crate::refresh::inflight::collect_tickets;
use crate::refresh::{BatchFetchFn, FetchFn};

// == Gate ==
/// Decides per read whether the cache is used.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassthroughGate {
    percentage: u32,
}

impl PassthroughGate {
    /// `percentage` of reads use the cache; 100 means all of them.
    pub(crate) fn new(percentage: u32) -> Self {
        Self { percentage }
    }

    pub(crate) fn use_cache(&self) -> bool {
        match self.percentage {
            0 => false,
            p if p >= 100 => true,
            p => rand::thread_rng().gen_range(0..100) < p,
        }
    }
}

// == Bypass Paths ==
impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fetches `key` directly, falling back to a live cached value if the
    /// source fails.
    pub(crate) async fn passthrough(&self, key: &str, fetch: &FetchFn<T>) -> Result<T> {
        match run_isolated(fetch()).await {
            Ok(value) => Ok(value),
            Err(err) => match self.get_shard(key).peek(key) {
                Some(value) => {
                    debug!(key = %key, error = %err, "Passthrough fetch failed, serving cached value");
                    Ok(value)
                }
                None => Err(err),
            },
        }
    }

    /// Fetches `ids` directly, optionally through the refresh buffers.
    ///
    /// On failure the error carries whatever the source returned plus any
    /// live cached values for the ids.
    pub(crate) async fn passthrough_batch(
        &self,
        ids: Vec<String>,
        key_fn: &KeyFn,
        fetch: &BatchFetchFn<T>,
    ) -> std::result::Result<HashMap<String, T>, BatchError<T>> {
        let (records, error) = if self.inner.options.passthrough_buffering
            && self.inner.options.buffering.is_some()
        {
            let tickets = self.inner.buffers.submit(
                self,
                ids.clone(),
                key_fn.clone(),
                fetch.clone(),
                false,
            );
            collect_tickets(tickets).await
        } else {
            match run_isolated(fetch(ids.clone())).await {
                Ok(records) => (records, None),
                Err(err) => (HashMap::new(), Some(err)),
            }
        };

        let Some(error) = error else {
            return Ok(records);
        };

        let mut cached: HashMap<String, T> = ids
            .iter()
            .filter_map(|id| {
                let key = key_fn(id);
                self.get_shard(&key).peek(&key).map(|value| (id.clone(), value))
            })
            .collect();
        cached.extend(records);
        Err(BatchError { cached, error })
    }
}
