//! Request and Response models for the demo server API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{BatchRequest, WriteRecordRequest};
pub use responses::{
    BatchResponse, DeleteResponse, ErrorResponse, HealthResponse, RecordResponse, StatsResponse,
    WriteResponse,
};
