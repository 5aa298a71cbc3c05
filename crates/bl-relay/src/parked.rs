//! Throttled queue messages waiting for their channel's next rate window
//!
//! A dispatch worker never sleeps on a throttled message. It parks the message
//! here and goes back to the queue, so other channels keep flowing. Once a
//! channel's window has rolled over its parked messages are released back to
//! the queue with their original priority and enqueue time.

use bl_common::OutgoingMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

#[derive(Debug)]
struct ParkedChannel {
    not_before: Instant,
    messages: Vec<OutgoingMessage>,
}

#[derive(Debug, Default)]
pub struct ParkedMessages {
    channels: DashMap<String, ParkedChannel>,
    count: AtomicUsize,
}

impl ParkedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a throttled message until `not_before`
    pub fn park(&self, message: OutgoingMessage, not_before: Instant) {
        let mut parked = self
            .channels
            .entry(message.channel.clone())
            .or_insert_with(|| ParkedChannel {
                not_before,
                messages: Vec::new(),
            });
        if not_before > parked.not_before {
            parked.not_before = not_before;
        }
        parked.messages.push(message);
        // Counted while the shard lock is held so a release never sees more than it counted
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Queue `message` behind its channel's parked messages, if there are any.
    /// Hands the message back when the channel has nothing parked.
    pub fn park_behind(&self, message: OutgoingMessage) -> Option<OutgoingMessage> {
        match self.channels.get_mut(&message.channel) {
            Some(mut parked) => {
                parked.messages.push(message);
                self.count.fetch_add(1, Ordering::AcqRel);
                None
            }
            None => Some(message),
        }
    }

    /// Take every message whose channel window has opened by `now`
    pub fn release_due(&self, now: Instant) -> Vec<OutgoingMessage> {
        let due: Vec<String> = self
            .channels
            .iter()
            .filter(|parked| parked.not_before <= now)
            .map(|parked| parked.key().clone())
            .collect();

        let mut released = Vec::new();
        for channel in due {
            if let Some((_, parked)) = self
                .channels
                .remove_if(&channel, |_, parked| parked.not_before <= now)
            {
                self.count.fetch_sub(parked.messages.len(), Ordering::AcqRel);
                released.extend(parked.messages);
            }
        }
        released
    }

    /// Take one channel's parked messages regardless of its window
    pub fn release_channel(&self, channel: &str) -> Vec<OutgoingMessage> {
        match self.channels.remove(channel) {
            Some((_, parked)) => {
                self.count.fetch_sub(parked.messages.len(), Ordering::AcqRel);
                parked.messages
            }
            None => Vec::new(),
        }
    }

    pub fn release_all(&self) -> Vec<OutgoingMessage> {
        let channels: Vec<String> = self.channels.iter().map(|parked| parked.key().clone()).collect();
        channels
            .iter()
            .flat_map(|channel| self.release_channel(channel))
            .collect()
    }

    /// Earliest instant at which some channel can be released
    pub fn next_release(&self) -> Option<Instant> {
        self.channels.iter().map(|parked| parked.not_before).min()
    }

    /// Copies of every parked message, for queue snapshots
    pub fn snapshot(&self) -> Vec<OutgoingMessage> {
        self.channels
            .iter()
            .flat_map(|parked| parked.messages.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
