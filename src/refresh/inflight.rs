//! In-Flight Calls
//!
//! Deduplicates concurrent fetches. The first caller for a key becomes the
//! leader and spawns the fetch; everyone else waits on the same [`Flight`].
//! The fetch runs in its own task, so a waiter that gives up (its future is
//! dropped) never cancels the shared call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::KeyFn;
use crate::error::{CacheError, Result};

// == Flight ==
/// A shared, not yet resolved fetch result.
pub(crate) struct Flight<V> {
    tx: watch::Sender<Option<Result<V>>>,
}

impl<V: Clone> Flight<V> {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// Publishes the result to every current and future waiter.
    pub(crate) fn complete(&self, result: Result<V>) {
        self.tx.send_replace(Some(result));
    }

    /// Waits for the result.
    pub(crate) async fn wait(&self) -> Result<V> {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(CacheError::Internal(
                "in-flight call ended without a result".to_string(),
            ))
        })
    }
}

/// Flight of a batch fetch; the records are keyed by id.
pub(crate) type BatchFlight<T> = Flight<Arc<HashMap<String, T>>>;

/// A flight together with the ids one caller expects from it.
pub(crate) type Ticket<T> = (Arc<BatchFlight<T>>, Vec<String>);

/// Waits for every ticket and collects the caller's records.
///
/// Returns every record that arrived together with the first error seen; a
/// failed flight contributes no records.
pub(crate) async fn collect_tickets<T: Clone>(
    tickets: Vec<Ticket<T>>,
) -> (HashMap<String, T>, Option<CacheError>) {
    let mut records = HashMap::new();
    let mut error = None;

    for (flight, ids) in tickets {
        match flight.wait().await {
            Ok(fetched) => {
                for id in ids {
                    if let Some(value) = fetched.get(&id) {
                        records.insert(id, value.clone());
                    }
                }
            }
            Err(err) => {
                error.get_or_insert(err);
            }
        }
    }

    (records, error)
}

// == Single-Key Calls ==
pub(crate) struct InFlight<T> {
    calls: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

impl<T: Clone> InFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the flight for `key`, starting one if there is none. The bool
    /// is true when the caller is the leader and must run the fetch.
    pub(crate) fn join_or_start(&self, key: &str) -> (Arc<Flight<T>>, bool) {
        let mut calls = self.calls.lock();
        if let Some(flight) = calls.get(key) {
            return (Arc::clone(flight), false);
        }
        let flight = Flight::new();
        calls.insert(key.to_string(), Arc::clone(&flight));
        (flight, true)
    }

    /// Starts a flight unless one is already running for `key`.
    pub(crate) fn try_start(&self, key: &str) -> Option<Arc<Flight<T>>> {
        match self.join_or_start(key) {
            (flight, true) => Some(flight),
            (_, false) => None,
        }
    }

    pub(crate) fn finish(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

// == Batch Calls ==
/// Outcome of registering a batch against the running flights.
pub(crate) struct BatchPlan<T> {
    /// Running flights that already cover some of the ids
    pub(crate) joined: Vec<Ticket<T>>,
    /// New flight the caller must run for the remaining ids
    pub(crate) started: Option<Ticket<T>>,
}

pub(crate) struct InFlightBatch<T> {
    calls: Mutex<HashMap<String, Arc<BatchFlight<T>>>>,
}

impl<T: Clone> InFlightBatch<T> {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Splits `ids` into ids already being fetched (grouped by flight) and
    /// ids that get a new flight, registered under their cache keys.
    pub(crate) fn plan(&self, ids: &[String], key_fn: &KeyFn) -> BatchPlan<T> {
        let mut calls = self.calls.lock();
        let mut joined: Vec<Ticket<T>> = Vec::new();
        let mut unique = Vec::new();

        for id in ids {
            match calls.get(&key_fn(id)) {
                Some(flight) => {
                    match joined.iter_mut().find(|(f, _)| Arc::ptr_eq(f, flight)) {
                        Some((_, flight_ids)) => flight_ids.push(id.clone()),
                        None => joined.push((Arc::clone(flight), vec![id.clone()])),
                    }
                }
                None => unique.push(id.clone()),
            }
        }

        let started = if unique.is_empty() {
            None
        } else {
            let flight = Flight::new();
            for id in &unique {
                calls.insert(key_fn(id), Arc::clone(&flight));
            }
            Some((flight, unique))
        };

        BatchPlan { joined, started }
    }

    /// Unregisters the keys still owned by `flight`.
    pub(crate) fn finish(&self, keys: &[String], flight: &Arc<BatchFlight<T>>) {
        let mut calls = self.calls.lock();
        for key in keys {
            if matches!(calls.get(key), Some(current) if Arc::ptr_eq(current, flight)) {
                calls.remove(key);
            }
        }
    }
}
