//! API Module
//!
//! HTTP handlers and routing for the demo server, which puts the cache in
//! front of a simulated slow record source.
//!
//! # Endpoints
//! - `GET /records/:id` - Read a record through the cache
//! - `POST /records/batch` - Read several records through the cache
//! - `PUT /records` - Write a record
//! - `DELETE /records/:id` - Delete a record
//! - `GET /stats` - Get cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;
pub mod source;

pub use handlers::*;
pub use routes::create_router;
pub use source::RecordSource;
