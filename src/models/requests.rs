//! Request DTOs for the demo server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

/// Maximum allowed record id length in bytes
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum number of ids in one batch request
pub const MAX_BATCH_IDS: usize = 1000;

/// Request body for writing a record (PUT /records)
///
/// # Fields
/// - `id`: The record id
/// - `value`: The record value, written to the source and the cache
#[derive(Debug, Clone, Deserialize)]
pub struct WriteRecordRequest {
    /// The record id
    pub id: String,
    /// The value to store
    pub value: String,
}

impl WriteRecordRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        validate_id(&self.id)
    }
}

/// Request body for a batch read (POST /records/batch)
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Ids to read; duplicates are read once
    pub ids: Vec<String>,
}

impl BatchRequest {
    /// Validates the request data
    pub fn validate(&self) -> Option<String> {
        if self.ids.is_empty() {
            return Some("ids cannot be empty".to_string());
        }
        if self.ids.len() > MAX_BATCH_IDS {
            return Some(format!("at most {} ids per batch", MAX_BATCH_IDS));
        }
        self.ids.iter().find_map(|id| validate_id(id))
    }
}

/// Checks a single record id.
pub fn validate_id(id: &str) -> Option<String> {
    if id.is_empty() {
        return Some("Id cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LENGTH {
        return Some(format!(
            "Id exceeds maximum length of {} characters",
            MAX_ID_LENGTH
        ));
    }
    None
}
