use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Grouping
// ============================================================================

/// Key selecting which bucket of a channel an entry accumulates into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupKey {
    /// Reserved key used by channels that batch everything together
    Global,
    /// Per-entity key extracted from the entry (e.g. a load identifier)
    Entity(String),
}

impl GroupKey {
    pub fn entity(id: impl Into<String>) -> Self {
        GroupKey::Entity(id.into())
    }

    pub fn is_global(&self) -> bool {
        matches!(self, GroupKey::Global)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Global => f.write_str("__GLOBAL__"),
            GroupKey::Entity(id) => f.write_str(id),
        }
    }
}

// ============================================================================
// Dispatch Work
// ============================================================================

/// A merged payload waiting for dispatch.
///
/// Ordered by `priority` ascending (lower is more urgent), then `enqueued_at`
/// ascending. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub channel: String,
    pub payload: String,
    pub priority: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Entries merged into `payload`
    #[serde(default = "one_entry")]
    pub entries: u64,
}

fn one_entry() -> u64 {
    1
}

impl OutgoingMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>, priority: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            payload: payload.into(),
            priority,
            enqueued_at: Utc::now(),
            entries: 1,
        }
    }

    pub fn with_entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Durable form of a payload whose dispatch failed.
///
/// The id starts with the failure time in epoch milliseconds, so ids sort in
/// failure order. `attempts` and `last_attempt_at` only matter when retry backoff is enabled;
/// records written without them load with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub id: String,
    pub channel: String,
    pub payload: String,
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default = "one_entry")]
    pub entries: u64,
}

impl RetryRecord {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-{}", now.timestamp_millis(), uuid::Uuid::new_v4()),
            channel: channel.into(),
            payload: payload.into(),
            failed_at: now,
            attempts: 1,
            last_attempt_at: Some(now),
            entries: 1,
        }
    }

    pub fn with_entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    /// Record another failed attempt at `at`
    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(at);
    }
}

// ============================================================================
// Dispatch Outcome
// ============================================================================

/// Why a dispatch attempt was skipped without a network call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Channel has dispatch disabled (or no configuration at all)
    DispatchDisabled,
    /// The content filter rejected the payload
    Filtered,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DispatchDisabled => f.write_str("dispatch disabled"),
            SkipReason::Filtered => f.write_str("filtered"),
        }
    }
}

/// Why a dispatch attempt did not deliver the payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("Throttled: channel admission denied")]
    Throttled,

    #[error("HTTP {status}: target rejected payload")]
    HttpStatus { status: u16 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Content error: {0}")]
    Content(String),
}

/// Tagged result of one send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { bytes: usize },
    Skipped { reason: SkipReason },
    Failed { cause: DispatchFailure },
}

impl DispatchOutcome {
    pub fn failed(cause: DispatchFailure) -> Self {
        DispatchOutcome::Failed { cause }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, DispatchOutcome::Failed { cause: DispatchFailure::Throttled })
    }

    /// Status written to the audit trail for this outcome
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DispatchOutcome::Sent { .. } => DeliveryStatus::Sent,
            DispatchOutcome::Skipped { .. } => DeliveryStatus::Skipped,
            DispatchOutcome::Failed { .. } => DeliveryStatus::Failed,
        }
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent { .. } => "sent",
            DispatchOutcome::Skipped { reason: SkipReason::DispatchDisabled } => "skipped_disabled",
            DispatchOutcome::Skipped { reason: SkipReason::Filtered } => "skipped_filtered",
            DispatchOutcome::Failed { cause: DispatchFailure::Throttled } => "throttled",
            DispatchOutcome::Failed { .. } => "failed",
        }
    }
}

/// Delivery status as recorded by the reporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
