//! Relay Tests
//!
//! End-to-end behavior of a running relay with an in-memory transport:
//! - size and window flush triggers
//! - throttled queued messages keep their place and still go out
//! - a throttled backlog never holds up other channels
//! - ingestion racing shutdown never loses an accepted entry
//! - shutdown flushes buckets and snapshots undelivered work
//! - removed channels release their buckets

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use bl_common::DispatchFailure;
use bl_config::{ChannelConfig, ChannelRegistry, DispatchMode, EngineConfig, Grouping, JoinStrategy};
use bl_queue::SnapshotStore;
use bl_relay::{MemoryRetryStore, Relay, RelayError, RetryStore, Transport};

/// Transport that records every payload, optionally taking its time
struct RecordingTransport {
    calls: Mutex<Vec<(String, String, Instant)>>,
    delay: Duration,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn payloads(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, payload, _)| payload.clone()).collect()
    }

    fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(&self, url: &str, payload: String) -> Result<(), DispatchFailure> {
        self.calls.lock().push((url.to_string(), payload, Instant::now()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn engine() -> EngineConfig {
    EngineConfig {
        dispatch_workers: 2,
        sweep_interval_ms: 100,
        poll_timeout_ms: 50,
        drain_timeout_secs: 2,
        throttle_backoff_ms: 100,
        ..Default::default()
    }
}

fn relay(channels: Vec<ChannelConfig>, transport: Arc<RecordingTransport>) -> Arc<Relay> {
    Relay::builder(
        Arc::new(ChannelRegistry::from_channels(channels)),
        transport,
        Arc::new(MemoryRetryStore::new()),
    )
    .engine(engine())
    .build()
}

#[tokio::test]
async fn test_size_trigger_flushes_in_arrival_order() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("loads", "http://target/loads")
            .with_window(60)
            .with_size_trigger(3)],
        transport.clone(),
    );
    relay.start().await.unwrap();

    relay.ingest("loads", r#"{"n":1}"#).unwrap();
    relay.ingest("loads", r#"{"n":2}"#).unwrap();
    assert_eq!(relay.buckets().open_buckets(), 1);
    relay.ingest("loads", r#"{"n":3}"#).unwrap();
    assert_eq!(relay.buckets().open_buckets(), 0);

    assert!(wait_until(|| transport.count() == 1).await);
    assert_eq!(transport.payloads(), vec![r#"[{"n":1},{"n":2},{"n":3}]"#.to_string()]);

    relay.shutdown().await;
    assert_eq!(transport.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_flush_after_channel_window() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("positions", "http://target/positions")
            .with_window(2)
            .with_join(JoinStrategy::Newline)],
        transport.clone(),
    );
    relay.start().await.unwrap();

    relay.ingest("positions", r#"{"lat":1}"#).unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.count(), 0);
    assert_eq!(relay.buckets().open_buckets(), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(wait_until(|| transport.count() == 1).await);
    assert_eq!(transport.payloads(), vec![r#"{"lat":1}"#.to_string()]);
    assert_eq!(relay.buckets().open_buckets(), 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_entities_get_separate_buckets() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("loads", "http://target/loads")
            .with_size_trigger(2)
            .with_grouping(Grouping::Field("loadId".to_string()))],
        transport.clone(),
    );
    relay.start().await.unwrap();

    relay.ingest("loads", r#"{"loadId":"A","s":1}"#).unwrap();
    relay.ingest("loads", r#"{"loadId":"B","s":1}"#).unwrap();
    relay.ingest("loads", r#"{"loadId":"A","s":2}"#).unwrap();

    assert!(wait_until(|| transport.count() == 1).await);
    assert_eq!(
        transport.payloads(),
        vec![r#"[{"loadId":"A","s":1},{"loadId":"A","s":2}]"#.to_string()]
    );
    assert_eq!(relay.buckets().open_buckets_for("loads"), 1);

    relay.shutdown().await;
    // Shutdown flushed B's bucket
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_malformed_and_unknown_entries_are_discarded() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("loads", "http://target/loads")
            .with_grouping(Grouping::Field("loadId".to_string()))],
        transport.clone(),
    );
    relay.start().await.unwrap();

    assert!(matches!(
        relay.ingest("loads", r#"{"other":1}"#),
        Err(RelayError::MalformedEntry { .. })
    ));
    assert!(matches!(
        relay.ingest("loads", "not json"),
        Err(RelayError::MalformedEntry { .. })
    ));
    assert!(matches!(
        relay.ingest("nobody", r#"{"loadId":"A"}"#),
        Err(RelayError::UnknownChannel(_))
    ));
    assert_eq!(relay.buckets().open_buckets(), 0);

    relay.shutdown().await;
    assert_eq!(transport.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_queue_messages_are_delivered_later() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("alerts", "http://target/alerts")
            .with_size_trigger(1)
            .with_throttle(1)],
        transport.clone(),
    );
    relay.start().await.unwrap();
    let started = Instant::now();

    for n in 0..3 {
        relay.ingest("alerts", &format!(r#"{{"n":{}}}"#, n)).unwrap();
    }

    assert!(wait_until(|| transport.count() == 3).await);
    let calls = transport.calls.lock().clone();
    // One per second window
    assert!(calls[2].2.duration_since(started) >= Duration::from_secs(2));
    let mut payloads: Vec<String> = calls.into_iter().map(|(_, payload, _)| payload).collect();
    payloads.sort();
    assert_eq!(payloads, vec![r#"[{"n":0}]"#, r#"[{"n":1}]"#, r#"[{"n":2}]"#]);

    // Throttling never produces retry records
    assert_eq!(relay.dispatcher().retry_store().count().await.unwrap(), 0);
    relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_throttled_backlog_does_not_delay_other_channels() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![
            ChannelConfig::new("slow", "http://target/slow")
                .with_size_trigger(1)
                .with_throttle(1),
            ChannelConfig::new("fast", "http://target/fast").with_size_trigger(1),
        ],
        transport.clone(),
    );
    relay.start().await.unwrap();
    let started = Instant::now();

    for n in 0..8 {
        relay.ingest("slow", &format!(r#"{{"n":{}}}"#, n)).unwrap();
    }
    relay.ingest("fast", r#"{"n":0}"#).unwrap();

    let fast_sent_at = || {
        transport
            .calls
            .lock()
            .iter()
            .find(|(url, _, _)| url.ends_with("/fast"))
            .map(|(_, _, at)| *at)
    };
    assert!(wait_until(|| fast_sent_at().is_some()).await);
    let waited = fast_sent_at().unwrap().duration_since(started);
    assert!(waited < Duration::from_secs(1), "fast channel waited {:?}", waited);

    // Only the first window's worth of the backlog went out ahead of it
    let slow_sent = transport
        .calls
        .lock()
        .iter()
        .filter(|(url, _, _)| url.ends_with("/slow"))
        .count();
    assert_eq!(slow_sent, 1);
    assert!(relay.parked_messages() > 0);
    assert!(relay.stats().await.parked > 0);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entries_accepted_during_shutdown_are_delivered() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("loads", "http://target/loads").with_window(60)],
        transport.clone(),
    );
    relay.start().await.unwrap();

    let producers: Vec<_> = (0..3)
        .map(|producer| {
            let relay = relay.clone();
            tokio::spawn(async move {
                let mut accepted = 0usize;
                for n in 0u64.. {
                    match relay.ingest("loads", &format!(r#"{{"p":{},"n":{}}}"#, producer, n)) {
                        Ok(()) => accepted += 1,
                        Err(RelayError::NotAccepting) => break,
                        Err(e) => panic!("unexpected ingest error: {}", e),
                    }
                    if n % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                accepted
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    relay.shutdown().await;

    let mut accepted = 0;
    for producer in producers {
        accepted += producer.await.unwrap();
    }
    assert!(accepted > 0);
    assert_eq!(relay.buckets().open_buckets(), 0);

    let delivered: usize = transport
        .payloads()
        .iter()
        .map(|payload| {
            serde_json::from_str::<Vec<serde_json::Value>>(payload)
                .unwrap()
                .len()
        })
        .sum();
    assert_eq!(delivered, accepted);
}

#[tokio::test]
async fn test_parked_messages_are_snapshotted_on_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let short_drain = EngineConfig {
        drain_timeout_secs: 1,
        ..engine()
    };

    let first_transport = RecordingTransport::new();
    let first = Relay::builder(
        Arc::new(ChannelRegistry::from_channels([ChannelConfig::new(
            "alerts",
            "http://target/alerts",
        )
        .with_size_trigger(1)
        .with_throttle(1)])),
        first_transport.clone(),
        Arc::new(MemoryRetryStore::new()),
    )
    .engine(short_drain.clone())
    .snapshot_store(SnapshotStore::new(tmp.path().join("queue")))
    .build();
    first.start().await.unwrap();

    for n in 0..5 {
        first.ingest("alerts", &format!(r#"{{"n":{}}}"#, n)).unwrap();
    }
    assert!(wait_until(|| first_transport.count() == 1).await);
    first.shutdown().await;
    assert!(first_transport.count() < 5);
    assert_eq!(first.parked_messages(), 0);

    // Same channel without a limit sends the rest
    let second_transport = RecordingTransport::new();
    let second = Relay::builder(
        Arc::new(ChannelRegistry::from_channels([ChannelConfig::new(
            "alerts",
            "http://target/alerts",
        )
        .with_size_trigger(1)])),
        second_transport.clone(),
        Arc::new(MemoryRetryStore::new()),
    )
    .engine(short_drain)
    .snapshot_store(SnapshotStore::new(tmp.path().join("queue")))
    .build();
    second.start().await.unwrap();

    let remaining = 5 - first_transport.count();
    assert!(wait_until(|| second_transport.count() == remaining).await);
    second.shutdown().await;

    let mut all = first_transport.payloads();
    all.extend(second_transport.payloads());
    all.sort();
    let expected: Vec<String> = (0..5).map(|n| format!(r#"[{{"n":{}}}]"#, n)).collect();
    assert_eq!(all, expected);
}

#[tokio::test]
async fn test_direct_mode_dispatches_without_queue() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![ChannelConfig::new("direct", "http://target/direct")
            .with_size_trigger(1)
            .with_dispatch_mode(DispatchMode::Direct)],
        transport.clone(),
    );
    relay.start().await.unwrap();

    relay.ingest("direct", r#"{"x":1}"#).unwrap();
    assert!(wait_until(|| transport.count() == 1).await);
    assert!(relay.queue().is_empty());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_snapshots_undelivered_messages_for_next_start() {
    let tmp = tempfile::tempdir().unwrap();
    let channels = || {
        vec![ChannelConfig::new("loads", "http://target/loads").with_size_trigger(1)]
    };
    let single_worker = EngineConfig {
        dispatch_workers: 1,
        drain_timeout_secs: 1,
        ..engine()
    };

    // First run: the only worker is stuck on a slow target
    let slow = RecordingTransport::with_delay(Duration::from_millis(1500));
    let first = Relay::builder(
        Arc::new(ChannelRegistry::from_channels(channels())),
        slow.clone(),
        Arc::new(MemoryRetryStore::new()),
    )
    .engine(single_worker.clone())
    .snapshot_store(SnapshotStore::new(tmp.path().join("queue")))
    .build();
    first.start().await.unwrap();

    for n in 1..=3 {
        first.ingest("loads", &format!(r#"{{"n":{}}}"#, n)).unwrap();
    }
    assert!(wait_until(|| slow.count() == 1).await);
    first.shutdown().await;
    assert_eq!(slow.count(), 1);
    assert!(matches!(first.ingest("loads", "{}"), Err(RelayError::NotAccepting)));

    // Second run picks up where the first left off
    let fast = RecordingTransport::new();
    let second = Relay::builder(
        Arc::new(ChannelRegistry::from_channels(channels())),
        fast.clone(),
        Arc::new(MemoryRetryStore::new()),
    )
    .engine(single_worker)
    .snapshot_store(SnapshotStore::new(tmp.path().join("queue")))
    .build();
    second.start().await.unwrap();

    assert!(wait_until(|| fast.count() == 2).await);
    assert_eq!(
        fast.payloads(),
        vec![r#"[{"n":2}]"#.to_string(), r#"[{"n":3}]"#.to_string()]
    );
    second.shutdown().await;
}

#[tokio::test]
async fn test_removed_channel_flushes_buckets_as_skipped() {
    let transport = RecordingTransport::new();
    let relay = relay(
        vec![
            ChannelConfig::new("loads", "http://target/loads"),
            ChannelConfig::new("legacy", "http://target/legacy"),
        ],
        transport.clone(),
    );
    relay.start().await.unwrap();

    relay.ingest("legacy", r#"{"old":true}"#).unwrap();
    assert_eq!(relay.buckets().open_buckets_for("legacy"), 1);

    let mut remaining = HashMap::new();
    remaining.insert(
        "loads".to_string(),
        Arc::new(ChannelConfig::new("loads", "http://target/loads")),
    );
    let diff = relay.apply_channels(remaining);
    assert_eq!(diff.removed, vec!["legacy".to_string()]);
    assert_eq!(relay.buckets().open_buckets_for("legacy"), 0);

    // Disabled now: drained from the queue without a network call
    assert!(wait_until(|| relay.queue().is_empty()).await);
    assert!(matches!(
        relay.ingest("legacy", r#"{"old":true}"#),
        Err(RelayError::UnknownChannel(_))
    ));
    relay.shutdown().await;
    assert_eq!(transport.count(), 0);
}
