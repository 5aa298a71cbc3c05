//! Hot-swappable channel table

use crate::{AppConfig, ChannelConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type ChannelMap = HashMap<String, Arc<ChannelConfig>>;

/// Channels whose configuration differs between two registry snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ChannelDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Latest per-channel configuration.
///
/// Readers clone an `Arc` out of the current map; a reload replaces the whole
/// map at once so no reader ever sees a half-applied update.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<Arc<ChannelMap>>,
}

impl ChannelRegistry {
    pub fn new(channels: ChannelMap) -> Self {
        Self {
            channels: RwLock::new(Arc::new(channels)),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.channel_map())
    }

    /// Build a registry from ready-made channel configs (keyed by `name`)
    pub fn from_channels<I>(channels: I) -> Self
    where
        I: IntoIterator<Item = ChannelConfig>,
    {
        Self::new(
            channels
                .into_iter()
                .map(|c| (c.name.clone(), Arc::new(c)))
                .collect(),
        )
    }

    /// Current configuration for `channel`; unknown channels come back fully disabled
    pub fn snapshot(&self, channel: &str) -> Arc<ChannelConfig> {
        let channels = self.channels.read().clone();
        match channels.get(channel) {
            Some(config) => config.clone(),
            None => Arc::new(ChannelConfig::disabled(channel)),
        }
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Swap in a new channel table and report what changed
    pub fn replace(&self, channels: ChannelMap) -> ChannelDiff {
        let new = Arc::new(channels);
        let old = {
            let mut guard = self.channels.write();
            std::mem::replace(&mut *guard, new.clone())
        };
        diff(&old, &new)
    }
}

fn diff(old: &ChannelMap, new: &ChannelMap) -> ChannelDiff {
    let mut result = ChannelDiff::default();
    for (name, config) in new {
        match old.get(name) {
            None => result.added.push(name.clone()),
            Some(previous) if previous != config => result.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    result.removed = old
        .keys()
        .filter(|name| !new.contains_key(*name))
        .cloned()
        .collect();

    result.added.sort();
    result.removed.sort();
    result.changed.sort();
    result
}
