//! Queue contents survive a snapshot and restart with order and payloads intact

use bl_common::OutgoingMessage;
use bl_queue::{OutgoingQueue, SnapshotStore};
use chrono::{Duration, Utc};

#[tokio::test]
async fn test_restart_preserves_order_and_payload_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path().join("queue"));
    let base = Utc::now();

    let before = OutgoingQueue::new();
    let mut urgent = OutgoingMessage::new("alerts", "{\"level\":\"high\"}", 1);
    urgent.enqueued_at = base + Duration::milliseconds(30);
    let mut multiline = OutgoingMessage::new("positions", "{\"a\":1}\n{\"a\":2}\n{\"a\":\"x\\ny\"}", 5);
    multiline.enqueued_at = base;
    let mut later = OutgoingMessage::new("positions", "[{\"b\":1}]", 5);
    later.enqueued_at = base + Duration::milliseconds(10);

    before.offer(later.clone());
    before.offer(multiline.clone());
    before.offer(urgent.clone());

    let written = store.save(&before.snapshot()).await.unwrap();
    assert_eq!(written, 3);

    // Fresh process: rehydrate before accepting new offers
    let after = OutgoingQueue::new();
    let restored = store.load().await.unwrap();
    assert_eq!(after.rehydrate(restored), 3);

    let drained: Vec<OutgoingMessage> = std::iter::from_fn(|| after.try_poll()).collect();
    assert_eq!(drained, vec![urgent, multiline, later]);
}

#[tokio::test]
async fn test_empty_queue_snapshot_clears_previous_records() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path().join("queue"));

    store
        .save(&[OutgoingMessage::new("stale", "{}", 3)])
        .await
        .unwrap();
    store.save(&[]).await.unwrap();

    assert!(store.load().await.unwrap().is_empty());
}
