//! Refresh Module
//!
//! Stampede protection on top of the cache: read-through fetches with
//! in-flight deduplication, background refreshes of stale entries, refresh
//! buffering per permutation and the passthrough gate.

mod buffer;
mod fetch;
mod inflight;
mod passthrough;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

pub(crate) use buffer::RefreshBuffers;
pub(crate) use inflight::{InFlight, InFlightBatch};
pub(crate) use passthrough::PassthroughGate;

/// Boxed future returned by type-erased fetch functions.
pub type BoxFuture<O> = Pin<Box<dyn Future<Output = O> + Send>>;

/// Type-erased single-key fetch.
pub(crate) type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<Result<T>> + Send + Sync>;

/// Type-erased batch fetch; the response is keyed by id.
pub(crate) type BatchFetchFn<T> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<Result<HashMap<String, T>>> + Send + Sync>;
