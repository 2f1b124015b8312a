//! Cache Key Module
//!
//! Derives cache keys from ids and from "permutation" values: serializable
//! structs describing the options a record was fetched with. Batch keys have
//! the shape `{prefix}-{permutation}-ID-{id}`; everything before the last
//! `ID-` marker is the permutation ID used to group refresh buffers.

use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::cache::clock::to_delta;
use crate::cache::Client;
use crate::error::{CacheError, Result};

const ID_MARKER: &str = "ID-";

/// Maps a record id to its cache key.
pub type KeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Returns a key function producing `{prefix}-ID-{id}`.
pub fn batch_key_fn(prefix: &str) -> KeyFn {
    let prefix = format!("{}-{}", prefix, ID_MARKER);
    Arc::new(move |id: &str| format!("{}{}", prefix, id))
}

/// Returns the permutation ID of a cache key: everything before the last
/// `ID-` marker, or the whole key when there is none.
pub fn extract_permutation(key: &str) -> &str {
    match key.rfind(ID_MARKER) {
        Some(index) => &key[..index],
        None => key,
    }
}

impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds `{prefix}-{field values}` from a serializable permutation.
    pub fn permutated_key<P: Serialize>(&self, prefix: &str, permutation: &P) -> Result<String> {
        let fields = self.key_format().render(permutation)?;
        Ok(join_key(prefix, &fields))
    }

    /// Returns a key function producing `{prefix}-{field values}-ID-{id}`.
    ///
    /// Relative timestamps are rendered once, when the key function is built.
    pub fn permutated_batch_key_fn<P: Serialize>(
        &self,
        prefix: &str,
        permutation: &P,
    ) -> Result<KeyFn> {
        let fields = self.key_format().render(permutation)?;
        let prefix = join_key(prefix, &fields);
        Ok(batch_key_fn(&prefix))
    }

    fn key_format(&self) -> KeyFormat {
        let options = &self.inner.options;
        KeyFormat {
            now: options.clock.now(),
            relative: options.relative_time_keys,
            truncation: to_delta(options.key_truncation),
        }
    }
}

fn join_key(prefix: &str, fields: &str) -> String {
    if fields.is_empty() {
        prefix.to_string()
    } else {
        format!("{}-{}", prefix, fields)
    }
}

struct KeyFormat {
    now: DateTime<Utc>,
    relative: bool,
    truncation: TimeDelta,
}

impl KeyFormat {
    fn render<P: Serialize>(&self, permutation: &P) -> Result<String> {
        let value = serde_json::to_value(permutation)
            .map_err(|e| CacheError::InvalidRequest(format!("unserializable permutation: {}", e)))?;
        Ok(self.format_value(&value))
    }

    fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(time) => self.format_time(time.with_timezone(&Utc)),
                Err(_) => s.clone(),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.format_value(item))
                .collect::<Vec<_>>()
                .join(","),
            // serde_json orders object fields by name
            Value::Object(fields) => fields
                .values()
                .map(|field| self.format_value(field))
                .collect::<Vec<_>>()
                .join("-"),
        }
    }

    fn truncate(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        if self.truncation <= TimeDelta::zero() {
            return time;
        }
        time.duration_trunc(self.truncation).unwrap_or(time)
    }

    fn format_time(&self, time: DateTime<Utc>) -> String {
        let target = self.truncate(time);
        if !self.relative {
            return target.timestamp().to_string();
        }

        let now = self.truncate(self.now);
        let (direction, diff) = if target > now {
            ("(+)", target - now)
        } else {
            ("(-)", now - target)
        };
        let seconds = diff.num_seconds();
        format!(
            "{}{:02}h{:02}m{:02}s",
            direction,
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
