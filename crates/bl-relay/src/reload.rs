//! Channel configuration hot reload
//!
//! Re-reads the config file on an interval and swaps the channel table of a
//! running [`Relay`]. A file that fails to load or validate is logged and the
//! current channels stay in place.

use crate::relay::Relay;
use crate::Result;
use bl_config::{ChannelDiff, ConfigLoader};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConfigReloader {
    loader: ConfigLoader,
    relay: Arc<Relay>,
}

impl ConfigReloader {
    pub fn new(loader: ConfigLoader, relay: Arc<Relay>) -> Self {
        Self { loader, relay }
    }

    /// Load, validate and apply the channel table once
    pub fn reload_once(&self) -> Result<ChannelDiff> {
        let config = self.loader.load()?;
        config.validate()?;
        Ok(self.relay.apply_channels(config.channel_map()))
    }

    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        info!(interval_secs = period.as_secs(), "Starting config reloader");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Startup already loaded the file
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reload_once() {
                        Ok(diff) if diff.is_empty() => debug!("Channel configuration unchanged"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Config reload failed, keeping current channels"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Config reloader shutting down");
                    break;
                }
            }
        }
    }

    /// Run under the relay's ticker token so shutdown stops it with the other tickers
    pub fn spawn(self, period: Duration) {
        let relay = self.relay.clone();
        let token = relay.ticker_token();
        relay.track(tokio::spawn(self.run(period, token)));
    }
}
