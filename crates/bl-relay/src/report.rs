//! Reporter: delivery counters and the CSV status trail

use crate::relay_metrics;
use async_trait::async_trait;
use bl_common::DeliveryStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CSV_HEADER: [&str; 5] = ["timestamp", "channel", "id", "count", "status"];

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Add `count` payloads totalling `bytes` to the outgoing totals
    fn record_outgoing(&self, count: u64, bytes: u64);

    /// Append one row to the status trail
    fn write_status(&self, channel: &str, id: Option<&str>, count: u64, status: DeliveryStatus);

    /// Write out anything still buffered. Called once at shutdown.
    async fn close(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    fn record_outgoing(&self, _count: u64, _bytes: u64) {}

    fn write_status(&self, _channel: &str, _id: Option<&str>, _count: u64, _status: DeliveryStatus) {}
}

#[derive(Debug)]
struct StatusRow {
    timestamp: DateTime<Utc>,
    channel: String,
    id: String,
    count: u64,
    status: DeliveryStatus,
}

/// Writes status rows to `<dir>/status-<YYYY-MM-DD>.csv` from a background task
pub struct CsvReporter {
    total_count: AtomicU64,
    total_bytes: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<StatusRow>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CsvReporter {
    /// Start the reporter and its writer task. Must be called inside a tokio runtime.
    pub fn start(dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(dir, 10_000)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(dir.into(), receiver));
        Self {
            total_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// `(payload count, bytes)` recorded as sent since start
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_count.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Reporter for CsvReporter {
    fn record_outgoing(&self, count: u64, bytes: u64) {
        self.total_count.fetch_add(count, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        relay_metrics::record_outgoing(count, bytes);
    }

    fn write_status(&self, channel: &str, id: Option<&str>, count: u64, status: DeliveryStatus) {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            debug!(channel, "Reporter closed, status row dropped");
            return;
        };
        let row = StatusRow {
            timestamp: Utc::now(),
            channel: channel.to_string(),
            id: id.unwrap_or_default().to_string(),
            count,
            status,
        };
        if let Err(e) = sender.try_send(row) {
            warn!(channel, error = %e, "Report buffer full, status row dropped");
        }
    }

    async fn close(&self) {
        self.sender.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Report writer task failed");
            }
        }
    }
}

async fn write_loop(dir: PathBuf, mut receiver: mpsc::Receiver<StatusRow>) {
    while let Some(row) = receiver.recv().await {
        if let Err(e) = append_row(&dir, &row).await {
            warn!(channel = %row.channel, error = %e, "Failed to write status row");
        }
    }
    debug!("Report writer stopped");
}

async fn append_row(dir: &Path, row: &StatusRow) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("status-{}.csv", row.timestamp.format("%Y-%m-%d")));
    let new_file = !tokio::fs::try_exists(&path).await?;

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    if new_file {
        writer.write_record(CSV_HEADER).map_err(std::io::Error::other)?;
    }
    writer
        .write_record([
            row.timestamp.to_rfc3339(),
            row.channel.clone(),
            row.id.clone(),
            row.count.to_string(),
            row.status.as_str().to_string(),
        ])
        .map_err(std::io::Error::other)?;
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await
}
