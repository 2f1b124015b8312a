//! Eviction Scheduler Task
//!
//! Background task that sweeps expired entries out of one shard per tick,
//! walking the shards round-robin. With the default period of
//! `ttl / num_shards` every shard is swept about once per TTL.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::{CacheOptions, Shard};

/// Handle to a running eviction task. Dropping it stops the task.
#[derive(Debug)]
pub struct EvictionScheduler {
    handle: JoinHandle<()>,
}

impl EvictionScheduler {
    /// Stops the task. The shard being swept, if any, finishes first.
    pub fn stop(self) {
        self.handle.abort();
    }

    /// Returns true once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns the eviction task.
///
/// Each tick reports an eviction run and sweeps the next shard in turn. A
/// panic while reporting or sweeping is logged and the scheduler moves on to
/// the next shard.
pub fn spawn_eviction_task<T>(
    shards: Arc<[Shard<T>]>,
    options: Arc<CacheOptions>,
    interval: Duration,
) -> EvictionScheduler
where
    T: Clone + Send + Sync + 'static,
{
    // Created before spawning so ticks scheduled by a test clock are not
    // missed while the task starts up.
    let mut ticker = options.clock.new_ticker(interval);

    let handle = tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            num_shards = shards.len(),
            "Starting eviction scheduler"
        );

        let mut next_shard = 0;
        while ticker.tick().await.is_some() {
            let shard = &shards[next_shard];
            let sweep = catch_unwind(AssertUnwindSafe(|| {
                options.metrics.eviction();
                shard.evict_expired()
            }));
            match sweep {
                Ok(0) => debug!(shard = next_shard, "Eviction sweep: no expired entries"),
                Ok(removed) => info!(shard = next_shard, removed, "Eviction sweep"),
                Err(_) => error!(shard = next_shard, "Eviction sweep panicked"),
            }

            next_shard = (next_shard + 1) % shards.len();
        }

        debug!("Eviction scheduler stopped");
    });

    EvictionScheduler { handle }
}
