//! Metrics for the aggregation and dispatch engine
//!
//! Recorder-agnostic: nothing is exported unless the binary installs a
//! `metrics` recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an entry accepted into a bucket
pub fn record_entry_ingested(channel: &str) {
    counter!(
        "bl_entries_ingested_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record an entry discarded because its grouping key could not be read
pub fn record_entry_malformed(channel: &str) {
    counter!(
        "bl_entries_malformed_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a bucket flush and what triggered it
pub fn record_flush(channel: &str, trigger: &str, entries: usize) {
    counter!(
        "bl_flushes_total",
        "channel" => channel.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
    histogram!(
        "bl_flush_entries",
        "channel" => channel.to_string()
    )
    .record(entries as f64);
}

/// Record the outcome of one dispatch attempt
pub fn record_dispatch(channel: &str, outcome: &str) {
    counter!(
        "bl_dispatch_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long the HTTP call of a dispatch took
pub fn record_dispatch_duration(channel: &str, duration: Duration) {
    histogram!(
        "bl_dispatch_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an admission denied by the throttler
pub fn record_throttled(channel: &str) {
    counter!(
        "bl_throttled_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record payloads and bytes reported as sent
pub fn record_outgoing(count: u64, bytes: u64) {
    counter!("bl_outgoing_messages_total").increment(count);
    counter!("bl_outgoing_bytes_total").increment(bytes);
}

/// Update the pending retry record gauge
pub fn set_retry_records_pending(count: usize) {
    gauge!("bl_retry_records_pending").set(count as f64);
}

/// Update the outgoing queue depth gauge
pub fn set_queue_depth(depth: usize) {
    gauge!("bl_queue_depth").set(depth as f64);
}

/// Update the open bucket gauge
pub fn set_open_buckets(count: usize) {
    gauge!("bl_open_buckets").set(count as f64);
}
