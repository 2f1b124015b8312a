//! Background Tasks Module
//!
//! Contains background tasks that run for the lifetime of a cache.
//!
//! # Tasks
//! - Eviction: Sweeps expired entries from one shard per tick

mod eviction;

pub use eviction::{spawn_eviction_task, EvictionScheduler};
