//! Metrics Module
//!
//! Reporting interface the cache calls into. The cache never reads anything
//! back from the recorder.

/// Callback returning the current number of cached entries.
pub type SizeFn = Box<dyn Fn() -> usize + Send + Sync>;

// == Metrics Recorder ==
/// Receives fire-and-forget cache events. Every method defaults to a no-op.
pub trait MetricsRecorder: Send + Sync {
    /// A read found a live entry.
    fn cache_hit(&self) {}

    /// A read found nothing usable.
    fn cache_miss(&self) {}

    /// The eviction scheduler ticked.
    fn eviction(&self) {}

    /// A shard ran out of room and evicted entries early.
    fn forced_eviction(&self) {}

    /// Number of entries removed by an eviction pass.
    fn entries_evicted(&self, _count: usize) {}

    /// The shard a key was routed to.
    fn shard_index(&self, _index: usize) {}

    /// Number of ids in a dispatched refresh batch.
    fn cache_batch_refresh_size(&self, _size: usize) {}

    /// Registers a callback computing the current cache size.
    fn observe_cache_size(&self, _callback: SizeFn) {}
}

/// Recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}
