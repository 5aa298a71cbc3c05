//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "batchline.toml",
    "config.toml",
    "./config/batchline.toml",
    "/etc/batchline/batchline.toml",
];

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "BATCHLINE_CONFIG";

/// Configuration loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_overrides(&mut config, |key| env::var(key).ok());

        Ok(config)
    }

    /// The file `load` would read, if any. Used by the reloader to re-read the same file.
    pub fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `BATCHLINE_*` overrides using `lookup` to read variables
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // HTTP
    set_parsed(&lookup, "BATCHLINE_HTTP_PORT", &mut config.http.port);
    if let Some(val) = lookup("BATCHLINE_HTTP_HOST") {
        config.http.host = val;
    }

    // General
    if let Some(val) = lookup("BATCHLINE_DATA_DIR") {
        config.data_dir = val;
    }

    // Engine
    set_parsed(&lookup, "BATCHLINE_DISPATCH_WORKERS", &mut config.engine.dispatch_workers);
    set_parsed(&lookup, "BATCHLINE_SWEEP_INTERVAL_MS", &mut config.engine.sweep_interval_ms);
    set_parsed(&lookup, "BATCHLINE_SNAPSHOT_INTERVAL_SECS", &mut config.engine.snapshot_interval_secs);
    set_parsed(&lookup, "BATCHLINE_RELOAD_INTERVAL_SECS", &mut config.engine.reload_interval_secs);

    // Dispatch
    set_parsed(&lookup, "BATCHLINE_REQUEST_TIMEOUT_MS", &mut config.dispatch.request_timeout_ms);
    set_parsed(&lookup, "BATCHLINE_CONNECT_TIMEOUT_MS", &mut config.dispatch.connect_timeout_ms);

    // Retry
    set_parsed(&lookup, "BATCHLINE_RETRY_INTERVAL_SECS", &mut config.retry.interval_secs);

    // Storage
    set_parsed(&lookup, "BATCHLINE_ARCHIVE_ENABLED", &mut config.storage.archive_enabled);
    set_parsed(&lookup, "BATCHLINE_REPORT_ENABLED", &mut config.storage.report_enabled);
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(val) = lookup(key) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %val, "Ignoring unparsable environment override"),
        }
    }
}
