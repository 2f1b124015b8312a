//! Forced Eviction Module
//!
//! Picks which entries a full shard drops. Candidates are ordered by
//! expiry (soonest first) and then by insertion order, so equally-expiring
//! entries are evicted oldest-inserted first.

use std::collections::HashMap;

use crate::cache::CacheEntry;

/// Number of entries to drop for `percentage` of `len`.
///
/// Rounds down but never returns zero for a non-empty shard and a non-zero
/// percentage, so a forced eviction always makes room.
pub fn eviction_count(len: usize, percentage: u32) -> usize {
    if len == 0 || percentage == 0 {
        return 0;
    }
    if percentage >= 100 {
        return len;
    }
    (len * percentage as usize / 100).clamp(1, len)
}

/// Returns the keys of the `count` entries closest to expiry.
pub fn select_victims<T>(entries: &HashMap<String, CacheEntry<T>>, count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<(&String, &CacheEntry<T>)> = entries.iter().collect();
    if count < candidates.len() {
        candidates.select_nth_unstable_by_key(count - 1, |(_, entry)| (entry.expires_at, entry.seq));
        candidates.truncate(count);
    }

    candidates.into_iter().map(|(key, _)| key.clone()).collect()
}
