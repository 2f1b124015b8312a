//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL and refresh
//! bookkeeping.

use chrono::{DateTime, TimeDelta, Utc};

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The stored value, None for a cached "not found" result
    pub value: Option<T>,
    /// Creation (or last successful refresh) time
    pub created_at: DateTime<Utc>,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
    /// Time after which a read triggers a background refresh, None when
    /// refreshes are disabled
    pub refresh_at: Option<DateTime<Utc>>,
    /// Number of refresh attempts since the entry was written
    pub refresh_retries: u32,
    /// Insertion order within the shard, used to break eviction ties
    pub(crate) seq: u64,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates a new entry written at `now` that lives for `ttl`.
    pub fn new(
        value: Option<T>,
        now: DateTime<Utc>,
        ttl: TimeDelta,
        refresh_at: Option<DateTime<Utc>>,
        seq: u64,
    ) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            refresh_at,
            refresh_retries: 0,
            seq,
        }
    }

    /// Returns true if the source confirmed the record does not exist.
    pub fn is_missing_record(&self) -> bool {
        self.value.is_none()
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once `now` reaches the expiration time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Checks if a read at `now` should trigger a background refresh.
    pub fn is_refresh_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.refresh_at, Some(refresh_at) if now >= refresh_at)
    }

    // == Time To Live ==
    /// Returns the remaining TTL, zero once expired.
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.expires_at - now).max(TimeDelta::zero())
    }
}
