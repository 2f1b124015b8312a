//! Cache Options Module
//!
//! Optional behaviour layered on top of the required constructor arguments.
//! Options are validated by [`Client::new`](crate::cache::Client::new) before
//! any shard is created.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Clock, MetricsRecorder, NoopRecorder, SystemClock};
use crate::error::{CacheError, Result};

/// Timing of background refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Earliest age at which a read triggers a refresh
    pub min_refresh_time: Duration,
    /// Latest age at which a read triggers a refresh
    pub max_refresh_time: Duration,
    /// Backoff base between failed refresh attempts
    pub retry_base_delay: Duration,
}

/// Limits of a refresh buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Number of ids that closes a buffer immediately
    pub batch_size: usize,
    /// Age at which an open buffer is dispatched regardless of size
    pub buffer_timeout: Duration,
}

// == Cache Options ==
/// Builder-style options applied at construction.
#[derive(Clone)]
pub struct CacheOptions {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<dyn MetricsRecorder>,
    pub(crate) eviction_interval: Option<Duration>,
    pub(crate) refreshes: Option<RefreshPolicy>,
    pub(crate) store_misses: bool,
    pub(crate) buffering: Option<BufferPolicy>,
    pub(crate) passthrough_percentage: u32,
    pub(crate) passthrough_buffering: bool,
    pub(crate) relative_time_keys: bool,
    pub(crate) key_truncation: Duration,
}

impl CacheOptions {
    /// Creates the default options: system clock, no metrics, no refreshes,
    /// cache fully active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom clock for expiry, refresh windows and scheduling.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reports cache events to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Overrides the eviction tick period (default `ttl / num_shards`).
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = Some(interval);
        self
    }

    /// Refreshes entries in the background once they are between
    /// `min_refresh_time` and `max_refresh_time` old.
    pub fn with_background_refreshes(
        mut self,
        min_refresh_time: Duration,
        max_refresh_time: Duration,
        retry_base_delay: Duration,
    ) -> Self {
        self.refreshes = Some(RefreshPolicy {
            min_refresh_time,
            max_refresh_time,
            retry_base_delay,
        });
        self
    }

    /// Caches "not found" results as missing records.
    pub fn with_missing_record_storage(mut self) -> Self {
        self.store_misses = true;
        self
    }

    /// Buffers batch refreshes per permutation until `batch_size` ids have
    /// accumulated or `buffer_timeout` has passed.
    pub fn with_refresh_buffering(mut self, batch_size: usize, buffer_timeout: Duration) -> Self {
        self.buffering = Some(BufferPolicy {
            batch_size,
            buffer_timeout,
        });
        self
    }

    /// Percentage of reads served through the cache. The rest go straight
    /// to the source. 100 keeps the cache fully active.
    pub fn with_passthrough_percentage(mut self, percentage: u32) -> Self {
        self.passthrough_percentage = percentage;
        self
    }

    /// Routes bypassed batch reads through the refresh buffers.
    pub fn with_passthrough_buffering(mut self) -> Self {
        self.passthrough_buffering = true;
        self
    }

    /// Renders timestamps in permutated keys relative to now, truncated to
    /// `truncation`.
    pub fn with_relative_time_key_format(mut self, truncation: Duration) -> Self {
        self.relative_time_keys = true;
        self.key_truncation = truncation;
        self
    }

    /// Truncates timestamps in permutated keys to `truncation`.
    pub fn with_key_truncation(mut self, truncation: Duration) -> Self {
        self.key_truncation = truncation;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(refreshes) = &self.refreshes {
            if refreshes.min_refresh_time > refreshes.max_refresh_time {
                return Err(CacheError::Config(
                    "min_refresh_time must not exceed max_refresh_time".to_string(),
                ));
            }
            if refreshes.retry_base_delay.is_zero() {
                return Err(CacheError::Config(
                    "retry_base_delay must be greater than zero".to_string(),
                ));
            }
        }

        if let Some(buffering) = &self.buffering {
            if self.refreshes.is_none() {
                return Err(CacheError::Config(
                    "refresh buffering requires background refreshes".to_string(),
                ));
            }
            if buffering.batch_size == 0 {
                return Err(CacheError::Config(
                    "batch_size must be greater than zero".to_string(),
                ));
            }
            if buffering.buffer_timeout.is_zero() {
                return Err(CacheError::Config(
                    "buffer_timeout must be greater than zero".to_string(),
                ));
            }
        }

        if self.passthrough_percentage > 100 {
            return Err(CacheError::Config(format!(
                "passthrough percentage must be between 0 and 100, got {}",
                self.passthrough_percentage
            )));
        }

        if self.passthrough_buffering && self.buffering.is_none() {
            return Err(CacheError::Config(
                "passthrough buffering requires refresh buffering".to_string(),
            ));
        }

        if matches!(self.eviction_interval, Some(interval) if interval.is_zero()) {
            return Err(CacheError::Config(
                "eviction interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopRecorder),
            eviction_interval: None,
            refreshes: None,
            store_misses: false,
            buffering: None,
            passthrough_percentage: 100,
            passthrough_buffering: false,
            relative_time_keys: false,
            key_truncation: Duration::ZERO,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("eviction_interval", &self.eviction_interval)
            .field("refreshes", &self.refreshes)
            .field("store_misses", &self.store_misses)
            .field("buffering", &self.buffering)
            .field("passthrough_percentage", &self.passthrough_percentage)
            .field("passthrough_buffering", &self.passthrough_buffering)
            .field("relative_time_keys", &self.relative_time_keys)
            .field("key_truncation", &self.key_truncation)
            .finish_non_exhaustive()
    }
}
