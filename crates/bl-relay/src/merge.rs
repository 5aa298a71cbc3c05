//! Merge a claimed batch into one payload

use crate::bucket::Batch;
use bl_config::{ChannelConfig, JoinStrategy};
use dashmap::DashMap;
use tracing::warn;

/// Joins batch entries using each channel's join strategy.
///
/// The strategy is pinned the first time a channel is merged; a later reload
/// that changes it is logged and ignored until restart.
#[derive(Debug, Default)]
pub struct Merger {
    strategies: DashMap<String, JoinStrategy>,
}

impl Merger {
    pub fn new() -> Self {
        Self {
            strategies: DashMap::new(),
        }
    }

    pub fn merge(&self, config: &ChannelConfig, batch: &Batch) -> String {
        let strategy = self.strategy_for(config);
        join(strategy, &batch.entries)
    }

    pub fn strategy_for(&self, config: &ChannelConfig) -> JoinStrategy {
        let pinned = *self
            .strategies
            .entry(config.name.clone())
            .or_insert(config.join);
        if pinned != config.join {
            warn!(
                channel = %config.name,
                pinned = ?pinned,
                configured = ?config.join,
                "Join strategy change ignored until restart"
            );
        }
        pinned
    }
}

pub fn join(strategy: JoinStrategy, entries: &[String]) -> String {
    match strategy {
        JoinStrategy::Array => {
            let body_len: usize = entries.iter().map(|e| e.len() + 1).sum();
            let mut payload = String::with_capacity(body_len + 2);
            payload.push('[');
            for (i, entry) in entries.iter().enumerate() {
                if i > 0 {
                    payload.push(',');
                }
                payload.push_str(entry);
            }
            payload.push(']');
            payload
        }
        JoinStrategy::Newline => entries.join("\n"),
    }
}
