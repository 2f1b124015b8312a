//! Response DTOs for the demo server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::HashMap;

use serde::Serialize;

use crate::cache::CacheStats;

/// Response body for a single read (GET /records/:id)
#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    /// The requested id
    pub id: String,
    /// The record value
    pub value: String,
}

impl RecordResponse {
    /// Creates a new RecordResponse
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// Response body for a batch read (POST /records/batch)
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    /// Records found, keyed by id
    pub records: HashMap<String, String>,
    /// Requested ids that do not exist, sorted
    pub missing: Vec<String>,
}

impl BatchResponse {
    /// Creates a BatchResponse, listing every requested id without a record
    pub fn new(requested: &[String], records: HashMap<String, String>) -> Self {
        let mut missing: Vec<String> = requested
            .iter()
            .filter(|id| !records.contains_key(*id))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        Self { records, missing }
    }
}

/// Response body for a write (PUT /records)
#[derive(Debug, Clone, Serialize)]
pub struct WriteResponse {
    /// Success message
    pub message: String,
    /// The id that was written
    pub id: String,
    /// True if caching the record forced an eviction
    pub forced_eviction: bool,
}

impl WriteResponse {
    /// Creates a new WriteResponse
    pub fn new(id: impl Into<String>, forced_eviction: bool) -> Self {
        let id = id.into();
        Self {
            message: format!("Record '{}' written successfully", id),
            id,
            forced_eviction,
        }
    }
}

/// Response body for a delete (DELETE /records/:id)
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Success message
    pub message: String,
    /// The id that was deleted
    pub id: String,
}

impl DeleteResponse {
    /// Creates a new DeleteResponse
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            message: format!("Record '{}' deleted successfully", id),
            id,
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Cache counters
    #[serde(flatten)]
    pub cache: CacheStats,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
    /// Calls that reached the backing source
    pub source_fetches: u64,
    /// Number of shards
    pub num_shards: usize,
}

impl StatsResponse {
    /// Creates a new StatsResponse from a stats snapshot
    pub fn new(cache: CacheStats, source_fetches: u64, num_shards: usize) -> Self {
        Self {
            hit_rate: cache.hit_rate(),
            cache,
            source_fetches,
            num_shards,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
