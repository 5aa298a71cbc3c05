//! Bucket Manager
//!
//! One accumulator per `(channel, group key)`. A bucket leaves the map exactly
//! once, through a single remove on its slot:
//! - `append` removes it in the same shard critical section that pushed the
//!   entry crossing the size trigger
//! - `sweep` removes it with `remove_if`, re-checking its age under the lock
//!
//! Whichever remove runs first wins; the loser finds the slot empty (or holding
//! a younger bucket) and does nothing.

use crate::error::RelayError;
use bl_common::GroupKey;
use bl_config::{ChannelConfig, Grouping};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What caused a bucket to flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Window,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Window => "window",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// A bucket claimed for flushing. Owned by whoever claimed it.
#[derive(Debug, Clone)]
pub struct Batch {
    pub channel: String,
    pub group: GroupKey,
    pub entries: Vec<String>,
    pub created_at: Instant,
    pub trigger: FlushTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    channel: String,
    group: GroupKey,
}

#[derive(Debug)]
struct Bucket {
    created_at: Instant,
    entries: Vec<String>,
}

impl Bucket {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Concurrent map of open buckets
#[derive(Debug, Default)]
pub struct BucketManager {
    buckets: DashMap<BucketKey, Bucket>,
}

impl BucketManager {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Append `entry` to the bucket for `(config.name, group)`.
    ///
    /// Returns the claimed batch when this append reached the channel's size trigger.
    pub fn append(&self, config: &ChannelConfig, group: GroupKey, entry: String) -> Option<Batch> {
        let size_trigger = config.size_trigger;
        let key = BucketKey {
            channel: config.name.clone(),
            group,
        };

        match self.buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().entries.push(entry);
                if size_trigger > 0 && occupied.get().entries.len() >= size_trigger {
                    let (key, bucket) = occupied.remove_entry();
                    return Some(into_batch(key, bucket, FlushTrigger::Size));
                }
                None
            }
            Entry::Vacant(vacant) => {
                let bucket = Bucket {
                    created_at: Instant::now(),
                    entries: vec![entry],
                };
                if size_trigger == 1 {
                    // Never becomes visible to a sweep
                    return Some(into_batch(vacant.into_key(), bucket, FlushTrigger::Size));
                }
                debug!(channel = %config.name, group = %vacant.key().group, "Opened bucket");
                vacant.insert(bucket);
                None
            }
        }
    }

    /// Claim every bucket of `channel` whose age has reached `window`
    pub fn sweep(&self, channel: &str, window: Duration) -> Vec<Batch> {
        self.sweep_at(channel, window, Instant::now())
    }

    pub fn sweep_at(&self, channel: &str, window: Duration, now: Instant) -> Vec<Batch> {
        // Collect first: removing while iterating would deadlock on the shard lock
        let expired: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|bucket| bucket.key().channel == channel && bucket.value().age(now) >= window)
            .map(|bucket| bucket.key().clone())
            .collect();

        let mut batches: Vec<Batch> = expired
            .into_iter()
            .filter_map(|key| {
                self.buckets
                    .remove_if(&key, |_, bucket| bucket.age(now) >= window)
                    .map(|(key, bucket)| into_batch(key, bucket, FlushTrigger::Window))
            })
            .collect();
        batches.sort_by_key(|batch| batch.created_at);
        batches
    }

    /// Claim every open bucket regardless of age
    pub fn drain_all(&self) -> Vec<Batch> {
        let keys: Vec<BucketKey> = self.buckets.iter().map(|b| b.key().clone()).collect();
        let mut batches: Vec<Batch> = keys
            .into_iter()
            .filter_map(|key| self.buckets.remove(&key))
            .map(|(key, bucket)| into_batch(key, bucket, FlushTrigger::Shutdown))
            .collect();
        batches.sort_by_key(|batch| batch.created_at);
        batches
    }

    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn open_buckets_for(&self, channel: &str) -> usize {
        self.buckets
            .iter()
            .filter(|bucket| bucket.key().channel == channel)
            .count()
    }
}

fn into_batch(key: BucketKey, bucket: Bucket, trigger: FlushTrigger) -> Batch {
    Batch {
        channel: key.channel,
        group: key.group,
        entries: bucket.entries,
        created_at: bucket.created_at,
        trigger,
    }
}

/// Derive the group key for a raw entry according to the channel's grouping rule.
///
/// The input must be JSON. For field grouping the field is read from the entry
/// itself, or from the first element when the entry is an array.
pub fn extract_group_key(config: &ChannelConfig, raw: &str) -> Result<GroupKey, RelayError> {
    match &config.grouping {
        Grouping::Global => {
            serde_json::from_str::<serde::de::IgnoredAny>(raw)
                .map_err(|e| RelayError::malformed(&config.name, format!("invalid JSON: {}", e)))?;
            Ok(GroupKey::Global)
        }
        Grouping::Field(field) => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| RelayError::malformed(&config.name, format!("invalid JSON: {}", e)))?;
            let first = match &value {
                Value::Array(items) => items
                    .first()
                    .ok_or_else(|| RelayError::malformed(&config.name, "empty array"))?,
                other => other,
            };
            match first.get(field) {
                Some(Value::String(id)) if !id.is_empty() => Ok(GroupKey::entity(id.as_str())),
                Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(GroupKey::entity(n.to_string())),
                Some(_) => Err(RelayError::malformed(
                    &config.name,
                    format!("field '{}' is not a non-empty string or integer", field),
                )),
                None => Err(RelayError::malformed(
                    &config.name,
                    format!("missing grouping field '{}'", field),
                )),
            }
        }
    }
}
