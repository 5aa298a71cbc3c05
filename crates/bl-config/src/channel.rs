//! Per-channel settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How entries of a channel are assigned to buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// Everything accumulates into the channel's single global bucket
    Global,
    /// One bucket per value of this JSON field
    Field(String),
}

/// How a bucket's entries are combined into one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    /// `[e1,e2,...]`
    Array,
    /// `e1\ne2\n...`
    Newline,
}

/// Which path a flushed payload takes to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Through the outgoing priority queue
    Queued,
    /// Straight from the flush on the dispatch worker pool
    Direct,
}

/// Immutable configuration snapshot for one channel.
///
/// Replaced wholesale on reload, never mutated while shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Filled from the `[channels.<name>]` table key
    #[serde(skip)]
    pub name: String,

    pub window_seconds: u64,
    /// Flush once a bucket holds this many entries; 0 disables the size trigger
    pub size_trigger: usize,
    pub throttle_enabled: bool,
    pub throttle_limit_per_second: u32,
    pub target_url: String,
    pub dispatch_enabled: bool,
    pub archive_enabled: bool,

    pub grouping: Grouping,
    pub join: JoinStrategy,
    pub dispatch_mode: DispatchMode,
    /// Queue priority of this channel's flushes (lower is more urgent)
    pub priority: u32,
    /// Base64 AES-256 key; payloads are encrypted after transform when set
    pub encryption_key: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            window_seconds: 60,
            size_trigger: 0,
            throttle_enabled: false,
            throttle_limit_per_second: 0,
            target_url: String::new(),
            dispatch_enabled: true,
            archive_enabled: false,
            grouping: Grouping::Global,
            join: JoinStrategy::Array,
            dispatch_mode: DispatchMode::Queued,
            priority: 5,
            encryption_key: None,
        }
    }
}

impl ChannelConfig {
    /// Create a channel with defaults and the given target
    pub fn new(name: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_url: target_url.into(),
            ..Default::default()
        }
    }

    /// Configuration used for channels that have no entry in the table
    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatch_enabled: false,
            archive_enabled: false,
            ..Default::default()
        }
    }

    pub fn with_window(mut self, window_seconds: u64) -> Self {
        self.window_seconds = window_seconds;
        self
    }

    pub fn with_size_trigger(mut self, size_trigger: usize) -> Self {
        self.size_trigger = size_trigger;
        self
    }

    pub fn with_throttle(mut self, limit_per_second: u32) -> Self {
        self.throttle_enabled = true;
        self.throttle_limit_per_second = limit_per_second;
        self
    }

    pub fn with_grouping(mut self, grouping: Grouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_join(mut self, join: JoinStrategy) -> Self {
        self.join = join;
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_archive(mut self, enabled: bool) -> Self {
        self.archive_enabled = enabled;
        self
    }

    pub fn with_dispatch_enabled(mut self, enabled: bool) -> Self {
        self.dispatch_enabled = enabled;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.throttle_enabled && self.throttle_limit_per_second == 0 {
            return Err("throttle_limit_per_second must be greater than 0 when throttling is enabled".to_string());
        }
        if self.dispatch_enabled {
            let url = self.target_url.trim();
            let rest = url
                .strip_prefix("http://")
                .or_else(|| url.strip_prefix("https://"));
            match rest {
                Some(host) if !host.is_empty() => {}
                _ => {
                    return Err(format!(
                        "target_url must be an http(s) URL when dispatch is enabled, got '{}'",
                        self.target_url
                    ))
                }
            }
        }
        if let Some(key) = &self.encryption_key {
            if key.trim().is_empty() {
                return Err("encryption_key must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_channel_turns_everything_off() {
        let config = ChannelConfig::disabled("unknown");
        assert_eq!(config.name, "unknown");
        assert!(!config.dispatch_enabled);
        assert!(!config.archive_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatch_requires_http_target() {
        assert!(ChannelConfig::new("a", "").validate().is_err());
        assert!(ChannelConfig::new("a", "ftp://host/x").validate().is_err());
        assert!(ChannelConfig::new("a", "http://").validate().is_err());
        assert!(ChannelConfig::new("a", "https://host/x").validate().is_ok());
        assert!(ChannelConfig::new("a", "").with_dispatch_enabled(false).validate().is_ok());
    }

    #[test]
    fn test_zero_throttle_limit_rejected() {
        let config = ChannelConfig::new("a", "http://host/x").with_throttle(0);
        assert!(config.validate().is_err());
    }
}
