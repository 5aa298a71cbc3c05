//! Per-channel fixed-window throttler
//!
//! Admission, not blocking: `admit` answers immediately and callers decide
//! what to do with a denial.

use bl_config::ChannelConfig;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottleState {
    counter: u32,
    window_start: Instant,
}

#[derive(Debug, Default)]
pub struct Throttler {
    channels: DashMap<String, ThrottleState>,
}

impl Throttler {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Admit one dispatch attempt for `config`'s channel in the current window
    pub fn admit(&self, config: &ChannelConfig) -> bool {
        self.admit_at(config, Instant::now())
    }

    pub fn admit_at(&self, config: &ChannelConfig, now: Instant) -> bool {
        if !config.throttle_enabled {
            return true;
        }
        let limit = config.throttle_limit_per_second;

        let mut state = self
            .channels
            .entry(config.name.clone())
            .or_insert_with(|| ThrottleState {
                counter: 0,
                window_start: now,
            });
        if now.saturating_duration_since(state.window_start) >= WINDOW {
            state.counter = 0;
            state.window_start = now;
        }
        if state.counter < limit {
            state.counter += 1;
            true
        } else {
            false
        }
    }

    /// When the channel's current window closes; `None` if it has no window yet
    pub fn window_end(&self, channel: &str) -> Option<Instant> {
        self.channels
            .get(channel)
            .map(|state| state.window_start + WINDOW)
    }

    /// Forget a channel's window, e.g. after it was removed from the configuration
    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }
}
