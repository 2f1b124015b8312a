//! Configuration Module
//!
//! Handles loading the demo server configuration from environment variables
//! and turning it into cache options.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheOptions;

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of entries across all shards
    pub capacity: usize,
    /// Number of independently locked shards
    pub num_shards: usize,
    /// Entry TTL in seconds
    pub ttl_secs: u64,
    /// Share of a full shard evicted to make room, in percent
    pub eviction_percentage: u32,
    /// Earliest entry age in ms at which reads trigger a refresh, 0 disables refreshes
    pub min_refresh_ms: u64,
    /// Latest entry age in ms at which reads trigger a refresh
    pub max_refresh_ms: u64,
    /// Backoff base between failed refreshes in ms
    pub retry_base_delay_ms: u64,
    /// Cache "not found" results
    pub store_misses: bool,
    /// Refresh buffer size, 0 disables buffering
    pub batch_size: usize,
    /// Refresh buffer timeout in ms
    pub buffer_timeout_ms: u64,
    /// Share of reads served through the cache, in percent
    pub passthrough_percentage: u32,
    /// Simulated latency of the backing source in ms
    pub source_latency_ms: u64,
    /// HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CAPACITY` - Maximum cache entries (default: 10000)
    /// - `NUM_SHARDS` - Number of shards (default: 10)
    /// - `TTL_SECS` - Entry TTL in seconds (default: 300)
    /// - `EVICTION_PERCENTAGE` - Forced eviction share (default: 10)
    /// - `MIN_REFRESH_MS` / `MAX_REFRESH_MS` - Refresh window (default: 30000 / 60000)
    /// - `RETRY_BASE_DELAY_MS` - Refresh retry backoff base (default: 1000)
    /// - `STORE_MISSES` - Cache not-found results (default: true)
    /// - `BATCH_SIZE` - Refresh buffer size (default: 10)
    /// - `BUFFER_TIMEOUT_MS` - Refresh buffer timeout (default: 50)
    /// - `PASSTHROUGH_PERCENTAGE` - Share of cached reads (default: 100)
    /// - `SOURCE_LATENCY_MS` - Simulated source latency (default: 200)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity: env_or("CAPACITY", defaults.capacity),
            num_shards: env_or("NUM_SHARDS", defaults.num_shards),
            ttl_secs: env_or("TTL_SECS", defaults.ttl_secs),
            eviction_percentage: env_or("EVICTION_PERCENTAGE", defaults.eviction_percentage),
            min_refresh_ms: env_or("MIN_REFRESH_MS", defaults.min_refresh_ms),
            max_refresh_ms: env_or("MAX_REFRESH_MS", defaults.max_refresh_ms),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            store_misses: env_or("STORE_MISSES", defaults.store_misses),
            batch_size: env_or("BATCH_SIZE", defaults.batch_size),
            buffer_timeout_ms: env_or("BUFFER_TIMEOUT_MS", defaults.buffer_timeout_ms),
            passthrough_percentage: env_or(
                "PASSTHROUGH_PERCENTAGE",
                defaults.passthrough_percentage,
            ),
            source_latency_ms: env_or("SOURCE_LATENCY_MS", defaults.source_latency_ms),
            server_port: env_or("SERVER_PORT", defaults.server_port),
        }
    }

    /// Returns the entry TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Builds the cache options described by this configuration.
    ///
    /// Buffering is only enabled together with background refreshes.
    pub fn cache_options(&self) -> CacheOptions {
        let mut options =
            CacheOptions::new().with_passthrough_percentage(self.passthrough_percentage);

        if self.store_misses {
            options = options.with_missing_record_storage();
        }
        if self.min_refresh_ms > 0 {
            options = options.with_background_refreshes(
                Duration::from_millis(self.min_refresh_ms),
                Duration::from_millis(self.max_refresh_ms.max(self.min_refresh_ms)),
                Duration::from_millis(self.retry_base_delay_ms),
            );
            if self.batch_size > 0 {
                options = options.with_refresh_buffering(
                    self.batch_size,
                    Duration::from_millis(self.buffer_timeout_ms),
                );
            }
        }

        options
    }
}

fn env_or<V: FromStr>(name: &str, default: V) -> V {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            num_shards: 10,
            ttl_secs: 300,
            eviction_percentage: 10,
            min_refresh_ms: 30_000,
            max_refresh_ms: 60_000,
            retry_base_delay_ms: 1_000,
            store_misses: true,
            batch_size: 10,
            buffer_timeout_ms: 50,
            passthrough_percentage: 100,
            source_latency_ms: 200,
            server_port: 3000,
        }
    }
}
