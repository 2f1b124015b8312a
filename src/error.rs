//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache.
///
/// The enum is `Clone` because a single fetch outcome is handed to every
/// caller waiting on the same in-flight call.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Invalid construction arguments or options
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The backing source confirmed that the record does not exist
    #[error("Record not found")]
    NotFound,

    /// The key is cached as a missing record
    #[error("Record is cached as missing")]
    MissingRecord,

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backing source failed
    #[error("Fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    /// A fetch task panicked or was aborted
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Wraps an arbitrary backing-source error.
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Fetch(Arc::new(err.into()))
    }

    /// Returns true for both "source says absent" and "cached as absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound | CacheError::MissingRecord)
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound | CacheError::MissingRecord => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::Fetch(_) => StatusCode::BAD_GATEWAY,
            CacheError::Config(_) | CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Batch Error ==
/// Returned by batch reads when the backing source fails.
///
/// `cached` holds every requested record that could still be served from the
/// cache; it is empty when nothing was cached.
#[derive(Debug, Clone)]
pub struct BatchError<T> {
    /// Records served from the cache despite the failure
    pub cached: HashMap<String, T>,
    /// The underlying failure
    pub error: CacheError,
}

impl<T> BatchError<T> {
    /// Creates a batch error without any cached records.
    pub fn new(error: CacheError) -> Self {
        Self {
            cached: HashMap::new(),
            error,
        }
    }

    /// Returns true when some records were still served from the cache.
    pub fn has_cached_records(&self) -> bool {
        !self.cached.is_empty()
    }
}

impl<T> fmt::Display for BatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cached.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(
                f,
                "only {} cached records could be returned: {}",
                self.cached.len(),
                self.error
            )
        }
    }
}

impl<T: fmt::Debug> std::error::Error for BatchError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<BatchError<T>> for CacheError {
    fn from(err: BatchError<T>) -> Self {
        err.error
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
