//! Cache Module
//!
//! Sharded in-memory storage with TTL expiration, forced eviction of full
//! shards and per-read refresh scheduling.

pub(crate) mod clock;
mod client;
mod entry;
mod eviction;
mod keys;
mod metrics;
mod options;
mod shard;
mod stats;


// Re-export public types
pub use client::Client;
pub use clock::{Clock, SystemClock, TestClock, Ticker, Timer};
pub use entry::CacheEntry;
pub use eviction::{eviction_count, select_victims};
pub use keys::{batch_key_fn, extract_permutation, KeyFn};
pub use metrics::{MetricsRecorder, NoopRecorder, SizeFn};
pub use options::{BufferPolicy, CacheOptions, RefreshPolicy};
pub use shard::{Shard, ShardHit};
pub use stats::{CacheStats, StatsRecorder};
