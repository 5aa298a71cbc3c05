//! Batchline Configuration System
//!
//! TOML-based configuration with environment variable overrides, the
//! per-channel settings table and the hot-swappable [`ChannelRegistry`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod channel;
mod loader;
mod registry;

pub use channel::{ChannelConfig, DispatchMode, Grouping, JoinStrategy};
pub use loader::ConfigLoader;
pub use registry::{ChannelDiff, ChannelRegistry};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub engine: EngineConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,

    /// Channel table keyed by channel name
    pub channels: BTreeMap<String, ChannelConfig>,

    /// Root directory for local state; storage paths left empty derive from it
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            channels: BTreeMap::new(),
            data_dir: "./data".to_string(),
        }
    }
}

/// Receiver bind address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Engine sizing and tick intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of dispatch workers (and direct-dispatch permits)
    pub dispatch_workers: usize,
    /// Bucket sweep interval per channel
    pub sweep_interval_ms: u64,
    /// Outgoing queue snapshot interval
    pub snapshot_interval_secs: u64,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub poll_timeout_ms: u64,
    /// Upper bound on waiting for the queue to drain at shutdown
    pub drain_timeout_secs: u64,
    /// Parking time for a throttled queued message when its channel has no rate window yet
    pub throttle_backoff_ms: u64,
    /// Config file re-read interval; 0 disables hot reload
    pub reload_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 4,
            sweep_interval_ms: 1000,
            snapshot_interval_secs: 60,
            poll_timeout_ms: 500,
            drain_timeout_secs: 10,
            throttle_backoff_ms: 100,
            reload_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_millis(self.throttle_backoff_ms)
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

/// Outbound HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            pool_max_idle_per_host: 10,
        }
    }
}

/// Retry sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Capped exponential backoff between retry attempts. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_secs: 30,
            max_secs: 3600,
        }
    }
}

impl BackoffConfig {
    /// Delay required after `attempts` failed attempts, or `None` when disabled
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self.base_secs.saturating_mul(1u64 << exponent);
        Some(Duration::from_secs(delay.min(self.max_secs)))
    }
}

/// Local storage locations and side-effect switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub queue_snapshot_dir: String,
    pub retry_dir: String,
    pub archive_dir: String,
    pub report_dir: String,
    pub archive_enabled: bool,
    pub report_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_snapshot_dir: String::new(),
            retry_dir: String::new(),
            archive_dir: String::new(),
            report_dir: String::new(),
            archive_enabled: true,
            report_enabled: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    pub fn queue_snapshot_dir(&self) -> PathBuf {
        self.storage_path(&self.storage.queue_snapshot_dir, "queue")
    }

    pub fn retry_dir(&self) -> PathBuf {
        self.storage_path(&self.storage.retry_dir, "retry")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.storage_path(&self.storage.archive_dir, "archive")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.storage_path(&self.storage.report_dir, "reports")
    }

    fn storage_path(&self, explicit: &str, default_leaf: &str) -> PathBuf {
        if explicit.is_empty() {
            Path::new(&self.data_dir).join(default_leaf)
        } else {
            PathBuf::from(explicit)
        }
    }

    /// Build registry snapshots, filling each channel's name from its table key
    pub fn channel_map(&self) -> HashMap<String, Arc<ChannelConfig>> {
        self.channels
            .iter()
            .map(|(name, channel)| {
                let mut channel = channel.clone();
                channel.name = name.clone();
                (name.clone(), Arc::new(channel))
            })
            .collect()
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.dispatch_workers == 0 {
            return Err(ConfigError::ValidationError(
                "engine.dispatch_workers must be greater than 0".to_string(),
            ));
        }
        for (field, value) in [
            ("engine.sweep_interval_ms", self.engine.sweep_interval_ms),
            ("engine.snapshot_interval_secs", self.engine.snapshot_interval_secs),
            ("engine.poll_timeout_ms", self.engine.poll_timeout_ms),
            ("retry.interval_secs", self.retry.interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    field
                )));
            }
        }
        if self.retry.backoff.enabled && self.retry.backoff.base_secs == 0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff.base_secs must be greater than 0 when backoff is enabled".to_string(),
            ));
        }

        for (name, channel) in &self.channels {
            channel
                .validate()
                .map_err(|reason| ConfigError::ValidationError(format!("channels.{}: {}", name, reason)))?;
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Batchline Configuration
# Environment variables override these settings

data_dir = "./data"

[http]
port = 8080
host = "0.0.0.0"

[engine]
dispatch_workers = 4
sweep_interval_ms = 1000
snapshot_interval_secs = 60
poll_timeout_ms = 500
drain_timeout_secs = 10
throttle_backoff_ms = 100
reload_interval_secs = 30

[dispatch]
connect_timeout_ms = 10000
request_timeout_ms = 30000

[retry]
interval_secs = 30

[retry.backoff]
enabled = false
base_secs = 30
max_secs = 3600

[storage]
archive_enabled = true
report_enabled = true

# Per-entity batching: one bucket per loadId
[channels.loads]
window_seconds = 5
size_trigger = 100
throttle_enabled = true
throttle_limit_per_second = 20
target_url = "http://localhost:9000/loads"
grouping = { field = "loadId" }
join = "array"
dispatch_mode = "queued"
priority = 2

# Global batching, newline-joined, dispatched straight from the flush
[channels.positions]
window_seconds = 2
target_url = "http://localhost:9000/positions"
grouping = "global"
join = "newline"
dispatch_mode = "direct"
"#
        .to_string()
    }
}
