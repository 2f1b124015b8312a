//! API Handlers
//!
//! HTTP request handlers for each demo server endpoint. Reads go through the
//! cache's read-through paths; writes update the source first and then the
//! cache.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::source::RecordSource;
use crate::cache::{batch_key_fn, Client, KeyFn, StatsRecorder};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::requests::validate_id;
use crate::models::{
    BatchRequest, BatchResponse, DeleteResponse, HealthResponse, RecordResponse, StatsResponse,
    WriteRecordRequest, WriteResponse,
};

/// Prefix of every record key.
const RECORD_PREFIX: &str = "record";

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sharded cache in front of the source
    pub cache: Client<String>,
    /// Simulated backing store
    pub source: Arc<RecordSource>,
    /// Counters reported by the cache
    pub stats: Arc<StatsRecorder>,
    /// Maps record ids to cache keys
    pub key_fn: KeyFn,
}

impl AppState {
    /// Creates a new AppState around an existing cache.
    ///
    /// `stats` must be the recorder the cache was built with.
    pub fn new(cache: Client<String>, source: Arc<RecordSource>, stats: Arc<StatsRecorder>) -> Self {
        Self {
            cache,
            source,
            stats,
            key_fn: batch_key_fn(RECORD_PREFIX),
        }
    }

    /// Creates a new AppState from configuration.
    ///
    /// Builds the cache with a [`StatsRecorder`] and a source preloaded with
    /// 100 records.
    pub fn from_config(config: &Config) -> Result<Self> {
        let stats = Arc::new(StatsRecorder::new());
        let options = config.cache_options().with_metrics(stats.clone());
        let cache = Client::new(
            config.capacity,
            config.num_shards,
            config.ttl(),
            config.eviction_percentage,
            options,
        )?;
        let source = Arc::new(RecordSource::with_records(
            Duration::from_millis(config.source_latency_ms),
            100,
        ));
        Ok(Self::new(cache, source, stats))
    }
}

/// Handler for GET /records/:id
///
/// Returns the record, fetching it from the source on a miss.
pub async fn get_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecordResponse>> {
    if let Some(error_msg) = validate_id(&id) {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let source = state.source.clone();
    let fetch_id = id.clone();
    let value = state
        .cache
        .get_or_fetch(&(state.key_fn)(&id), move || {
            let source = source.clone();
            let id = fetch_id.clone();
            async move { source.fetch(&id).await }
        })
        .await?;

    Ok(Json(RecordResponse::new(id, value)))
}

/// Handler for POST /records/batch
///
/// Returns every requested record that exists, fetching all misses with a
/// single source call.
pub async fn batch_handler(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let source = state.source.clone();
    let records = state
        .cache
        .get_or_fetch_batch(&req.ids, &state.key_fn, move |ids: Vec<String>| {
            let source = source.clone();
            async move { source.fetch_batch(&ids).await }
        })
        .await?;

    Ok(Json(BatchResponse::new(&req.ids, records)))
}

/// Handler for PUT /records
///
/// Writes the record to the source and caches it.
pub async fn write_record_handler(
    State(state): State<AppState>,
    Json(req): Json<WriteRecordRequest>,
) -> Result<Json<WriteResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    state.source.upsert(req.id.clone(), req.value.clone());
    let forced_eviction = state.cache.set((state.key_fn)(&req.id), req.value);

    Ok(Json(WriteResponse::new(req.id, forced_eviction)))
}

/// Handler for DELETE /records/:id
///
/// Removes the record from the source and the cache.
pub async fn delete_record_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if !state.source.remove(&id) {
        return Err(CacheError::NotFound);
    }
    state.cache.delete(&(state.key_fn)(&id));

    Ok(Json(DeleteResponse::new(id)))
}

/// Handler for GET /stats
///
/// Returns current cache statistics.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.stats.snapshot(),
        state.source.calls(),
        state.cache.num_shards(),
    ))
}

/// Handler for GET /health
///
/// Returns health status of the server.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
