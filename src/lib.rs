//! Sturdy Cache - a sharded in-memory cache with stampede protection
//!
//! Provides TTL expiration, forced eviction of full shards, background
//! refreshes, batched refresh buffering and negative caching, plus a demo
//! HTTP server that puts the cache in front of a slow record source.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod refresh;
pub mod tasks;

pub use api::AppState;
pub use cache::{
    batch_key_fn, CacheOptions, CacheStats, Client, Clock, KeyFn, MetricsRecorder,
    StatsRecorder, SystemClock, TestClock,
};
pub use config::Config;
pub use error::{BatchError, CacheError, Result};
pub use tasks::{spawn_eviction_task, EvictionScheduler};
