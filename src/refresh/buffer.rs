//! Refresh Buffers
//!
//! Collects ids due for a batch refresh per permutation, so records fetched
//! with the same options are refreshed by one call. A buffer is dispatched
//! once it holds `batch_size` ids or its timer fires, whichever comes first.
//!
//! Every buffer carries a generation number. Its timer only dispatches the
//! buffer it was started for: if that buffer already filled up and a new one
//! was opened under the same permutation, the stale timer does nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::{extract_permutation, BufferPolicy, Client, KeyFn};
use crate::refresh::fetch::run_isolated;
use crate::refresh::inflight::{BatchFlight, Flight, Ticket};
use crate::refresh::BatchFetchFn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    permutation: String,
    /// Bypassed reads never share a buffer with refreshes
    persist: bool,
}

struct OpenBuffer<T> {
    generation: u64,
    ids: Vec<String>,
    key_fn: KeyFn,
    fetch: BatchFetchFn<T>,
    flight: Arc<BatchFlight<T>>,
}

struct BufferState<T> {
    next_generation: u64,
    open: HashMap<BufferKey, OpenBuffer<T>>,
}

// == Refresh Buffers ==
pub(crate) struct RefreshBuffers<T> {
    policy: Option<BufferPolicy>,
    state: Mutex<BufferState<T>>,
}

impl<T> RefreshBuffers<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(policy: Option<BufferPolicy>) -> Self {
        Self {
            policy,
            state: Mutex::new(BufferState {
                next_generation: 0,
                open: HashMap::new(),
            }),
        }
    }

    /// Adds `ids` to the buffer of their permutation.
    ///
    /// Returns one ticket per buffer the ids landed in. With `persist` set
    /// the fetched records are written to the cache; otherwise they are only
    /// handed to the waiters.
    pub(crate) fn submit(
        &self,
        client: &Client<T>,
        ids: Vec<String>,
        key_fn: KeyFn,
        fetch: BatchFetchFn<T>,
        persist: bool,
    ) -> Vec<Ticket<T>> {
        let Some(first) = ids.first() else {
            return Vec::new();
        };
        let Some(policy) = self.policy else {
            let flight = Flight::new();
            let buffer = OpenBuffer {
                generation: 0,
                ids: ids.clone(),
                key_fn,
                fetch,
                flight: Arc::clone(&flight),
            };
            dispatch(client, buffer, persist);
            return vec![(flight, ids)];
        };

        let batch_size = policy.batch_size.max(1);
        let key = BufferKey {
            permutation: extract_permutation(&key_fn(first)).to_string(),
            persist,
        };

        let mut tickets: Vec<Ticket<T>> = Vec::new();
        let mut full = Vec::new();
        let mut opened = Vec::new();
        {
            let mut state = self.state.lock();
            let BufferState {
                next_generation,
                open,
            } = &mut *state;

            for id in ids {
                let buffer = open.entry(key.clone()).or_insert_with(|| {
                    *next_generation += 1;
                    opened.push(*next_generation);
                    OpenBuffer {
                        generation: *next_generation,
                        ids: Vec::with_capacity(batch_size),
                        key_fn: key_fn.clone(),
                        fetch: fetch.clone(),
                        flight: Flight::new(),
                    }
                });

                match tickets.last_mut() {
                    Some((flight, ticket_ids)) if Arc::ptr_eq(flight, &buffer.flight) => {
                        ticket_ids.push(id.clone());
                    }
                    _ => tickets.push((Arc::clone(&buffer.flight), vec![id.clone()])),
                }
                if !buffer.ids.contains(&id) {
                    buffer.ids.push(id);
                }

                if buffer.ids.len() >= batch_size {
                    if let Some(buffer) = open.remove(&key) {
                        opened.retain(|generation| *generation != buffer.generation);
                        full.push(buffer);
                    }
                }
            }
        }

        for buffer in full {
            debug!(permutation = %key.permutation, "Refresh buffer full");
            dispatch(client, buffer, persist);
        }
        for generation in opened {
            self.start_timer(client, key.clone(), generation, &policy);
        }

        tickets
    }

    fn start_timer(&self, client: &Client<T>, key: BufferKey, generation: u64, policy: &BufferPolicy) {
        let timer = client.inner.options.clock.new_timer(policy.buffer_timeout);
        let client = client.clone();
        tokio::spawn(async move {
            if timer.fired().await.is_some() {
                client.inner.buffers.expire(&client, &key, generation);
            }
        });
    }

    /// Dispatches the buffer for `key` if it is still the one `generation`
    /// was opened for.
    fn expire(&self, client: &Client<T>, key: &BufferKey, generation: u64) {
        let buffer = {
            let mut state = self.state.lock();
            match state.open.get(key) {
                Some(buffer) if buffer.generation == generation => state.open.remove(key),
                _ => None,
            }
        };

        if let Some(buffer) = buffer {
            debug!(permutation = %key.permutation, ids = buffer.ids.len(), "Refresh buffer timed out");
            dispatch(client, buffer, key.persist);
        }
    }

    #[cfg(test)]
    fn open_buffers(&self) -> usize {
        self.state.lock().open.len()
    }
}

/// Runs the fetch for a closed buffer and publishes the result.
fn dispatch<T>(client: &Client<T>, buffer: OpenBuffer<T>, persist: bool)
where
    T: Clone + Send + Sync + 'static,
{
    let client = client.clone();
    tokio::spawn(async move {
        let OpenBuffer {
            ids,
            key_fn,
            fetch,
            flight,
            ..
        } = buffer;

        if persist {
            client.inner.options.metrics.cache_batch_refresh_size(ids.len());
        }

        let result = match run_isolated(fetch(ids.clone())).await {
            Ok(records) => {
                if persist {
                    client.store_batch_response(&ids, &key_fn, &records);
                }
                Ok(Arc::new(records))
            }
            Err(err) => {
                warn!(ids = ids.len(), error = %err, "Buffered batch fetch failed");
                Err(err)
            }
        };
        flight.complete(result);
    });
}
