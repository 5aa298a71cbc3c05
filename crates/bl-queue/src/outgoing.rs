//! Outgoing Priority Queue
//!
//! Lower `priority` dequeues first; equal priorities dequeue by earlier
//! `enqueued_at`, and a per-queue sequence number breaks exact timestamp ties
//! in offer order.

use bl_common::OutgoingMessage;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct QueueEntry {
    seq: u64,
    message: OutgoingMessage,
}

impl QueueEntry {
    fn key(&self) -> (u32, chrono::DateTime<chrono::Utc>, u64) {
        (self.message.priority, self.message.enqueued_at, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap pops the greatest entry, so the smallest key must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Priority queue of merged payloads awaiting dispatch
pub struct OutgoingQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    next_seq: AtomicU64,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Add a message without blocking
    pub fn offer(&self, message: OutgoingMessage) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let depth = {
            let mut heap = self.heap.lock();
            heap.push(QueueEntry { seq, message });
            heap.len()
        };
        debug!(depth, "Message offered to outgoing queue");
        self.notify.notify_one();
    }

    /// Take the head of the queue if there is one
    pub fn try_poll(&self) -> Option<OutgoingMessage> {
        self.heap.lock().pop().map(|entry| entry.message)
    }

    /// Take the head of the queue, waiting up to `timeout` for one to arrive
    pub async fn poll(&self, timeout: Duration) -> Option<OutgoingMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an offer between the check and the await is not missed
            notified.as_mut().enable();

            if let Some(message) = self.try_poll() {
                return Some(message);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_poll();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Copy of the queued messages in dequeue order. The queue is left untouched.
    pub fn snapshot(&self) -> Vec<OutgoingMessage> {
        let mut entries: Vec<(u32, chrono::DateTime<chrono::Utc>, u64, OutgoingMessage)> = self
            .heap
            .lock()
            .iter()
            .map(|entry| {
                let (priority, enqueued_at, seq) = entry.key();
                (priority, enqueued_at, seq, entry.message.clone())
            })
            .collect();
        entries.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        entries.into_iter().map(|(_, _, _, message)| message).collect()
    }

    /// Restore previously snapshotted messages, keeping their priority and enqueue time
    pub fn rehydrate(&self, messages: Vec<OutgoingMessage>) -> usize {
        let count = messages.len();
        {
            let mut heap = self.heap.lock();
            for message in messages {
                let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                heap.push(QueueEntry { seq, message });
            }
        }
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }
}

impl Default for OutgoingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn message(channel: &str, priority: u32) -> OutgoingMessage {
        OutgoingMessage::new(channel, format!("payload-{}", channel), priority)
    }

    #[test]
    fn test_lower_priority_first() {
        let queue = OutgoingQueue::new();
        queue.offer(message("low", 9));
        queue.offer(message("high", 1));
        queue.offer(message("mid", 5));

        assert_eq!(queue.try_poll().unwrap().channel, "high");
        assert_eq!(queue.try_poll().unwrap().channel, "mid");
        assert_eq!(queue.try_poll().unwrap().channel, "low");
        assert!(queue.try_poll().is_none());
    }

    #[test]
    fn test_equal_priority_is_fifo_by_enqueue_time() {
        let queue = OutgoingQueue::new();
        let now = Utc::now();

        let mut late = message("late", 3);
        late.enqueued_at = now;
        let mut early = message("early", 3);
        early.enqueued_at = now - ChronoDuration::seconds(5);

        queue.offer(late);
        queue.offer(early);

        assert_eq!(queue.try_poll().unwrap().channel, "early");
        assert_eq!(queue.try_poll().unwrap().channel, "late");
    }

    #[test]
    fn test_identical_timestamps_keep_offer_order() {
        let queue = OutgoingQueue::new();
        let now = Utc::now();
        for name in ["a", "b", "c"] {
            let mut msg = message(name, 2);
            msg.enqueued_at = now;
            queue.offer(msg);
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.try_poll())
            .map(|m| m.channel)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_is_dequeue_order_and_non_destructive() {
        let queue = OutgoingQueue::new();
        queue.offer(message("b", 4));
        queue.offer(message("a", 1));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].channel, "a");
        assert_eq!(snapshot[1].channel, "b");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reoffered_message_keeps_position() {
        let queue = OutgoingQueue::new();
        let base = Utc::now();
        let at = |name: &str, offset: i64| {
            let mut msg = message(name, 5);
            msg.enqueued_at = base + ChronoDuration::milliseconds(offset);
            msg
        };
        queue.offer(at("first", 0));
        queue.offer(at("second", 1));

        // A worker takes the head, is throttled, and puts the same message back
        let head = queue.try_poll().unwrap();
        queue.offer(at("third", 2));
        queue.offer(head);

        assert_eq!(queue.try_poll().unwrap().channel, "first");
        assert_eq!(queue.try_poll().unwrap().channel, "second");
        assert_eq!(queue.try_poll().unwrap().channel, "third");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_when_empty() {
        let queue = OutgoingQueue::new();
        let started = Instant::now();

        assert!(queue.poll(Duration::from_millis(200)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_on_offer() {
        let queue = Arc::new(OutgoingQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.offer(message("late-arrival", 1));

        let received = waiter.await.unwrap();
        assert_eq!(received.unwrap().channel, "late-arrival");
    }

    #[test]
    fn test_rehydrate_restores_order() {
        let queue = OutgoingQueue::new();
        let restored = vec![message("x", 7), message("y", 2)];

        assert_eq!(queue.rehydrate(restored), 2);
        queue.offer(message("z", 3));

        assert_eq!(queue.try_poll().unwrap().channel, "y");
        assert_eq!(queue.try_poll().unwrap().channel, "z");
        assert_eq!(queue.try_poll().unwrap().channel, "x");
    }
}
