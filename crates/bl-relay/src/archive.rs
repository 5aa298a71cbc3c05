//! Archiver: best-effort write-behind log of incoming and merged payloads
//!
//! Calls never block and never fail from the caller's point of view. Records
//! that cannot be queued or written are logged and dropped.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[async_trait]
pub trait Archiver: Send + Sync {
    fn archive_incoming(&self, channel: &str, raw: &str);

    fn archive_merged(&self, channel: &str, payload: &str);

    /// Write out anything still buffered. Called once at shutdown.
    async fn close(&self) {}
}

/// Archiver that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArchiver;

#[async_trait]
impl Archiver for NoopArchiver {
    fn archive_incoming(&self, _channel: &str, _raw: &str) {}

    fn archive_merged(&self, _channel: &str, _payload: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Incoming,
    Merged,
}

impl ArchiveKind {
    fn file_name(&self) -> &'static str {
        match self {
            ArchiveKind::Incoming => "incoming.log",
            ArchiveKind::Merged => "merged.log",
        }
    }
}

#[derive(Debug)]
struct ArchiveRecord {
    kind: ArchiveKind,
    channel: String,
    body: String,
}

/// Configuration for [`FileArchiver`]
#[derive(Debug, Clone)]
pub struct FileArchiverConfig {
    pub dir: PathBuf,
    /// Records buffered before new ones are dropped
    pub capacity: usize,
}

impl FileArchiverConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            capacity: 10_000,
        }
    }
}

/// Appends one JSON-string line per record to
/// `<dir>/<channel>/<YYYY-MM-DD>/{incoming,merged}.log`.
pub struct FileArchiver {
    sender: Mutex<Option<mpsc::Sender<ArchiveRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl FileArchiver {
    /// Start the archiver and its writer task. Must be called inside a tokio runtime.
    pub fn start(config: FileArchiverConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let writer = tokio::spawn(write_loop(config.dir, receiver));
        Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    fn enqueue(&self, kind: ArchiveKind, channel: &str, body: &str) {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            debug!(channel, "Archiver closed, record dropped");
            return;
        };
        let record = ArchiveRecord {
            kind,
            channel: channel.to_string(),
            body: body.to_string(),
        };
        if let Err(e) = sender.try_send(record) {
            warn!(channel, kind = ?kind, error = %e, "Archive buffer full, record dropped");
        }
    }
}

#[async_trait]
impl Archiver for FileArchiver {
    fn archive_incoming(&self, channel: &str, raw: &str) {
        self.enqueue(ArchiveKind::Incoming, channel, raw);
    }

    fn archive_merged(&self, channel: &str, payload: &str) {
        self.enqueue(ArchiveKind::Merged, channel, payload);
    }

    async fn close(&self) {
        // Dropping the sender ends the writer loop once the buffer is drained
        self.sender.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Archive writer task failed");
            }
        }
    }
}

async fn write_loop(dir: PathBuf, mut receiver: mpsc::Receiver<ArchiveRecord>) {
    while let Some(record) = receiver.recv().await {
        if let Err(e) = write_record(&dir, &record).await {
            warn!(
                channel = %record.channel,
                kind = ?record.kind,
                error = %e,
                "Failed to archive record"
            );
        }
    }
    debug!("Archive writer stopped");
}

async fn write_record(dir: &Path, record: &ArchiveRecord) -> std::io::Result<()> {
    let day = Utc::now().format("%Y-%m-%d").to_string();
    let folder = dir.join(safe_segment(&record.channel)).join(day);
    tokio::fs::create_dir_all(&folder).await?;

    // JSON string encoding keeps multi-line payloads on one line
    let mut line = serde_json::to_string(&record.body)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(folder.join(record.kind.file_name()))
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Make a channel name safe to use as a single path segment
pub(crate) fn safe_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_written_one_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = FileArchiver::start(FileArchiverConfig::new(tmp.path()));

        archiver.archive_incoming("loads", "{\"a\":1}");
        archiver.archive_merged("loads", "{\"a\":1}\n{\"a\":2}");
        archiver.close().await;

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let folder = tmp.path().join("loads").join(day);

        let incoming = std::fs::read_to_string(folder.join("incoming.log")).unwrap();
        assert_eq!(incoming, "\"{\\\"a\\\":1}\"\n");

        let merged = std::fs::read_to_string(folder.join("merged.log")).unwrap();
        assert_eq!(merged.lines().count(), 1);
        let decoded: String = serde_json::from_str(merged.trim_end()).unwrap();
        assert_eq!(decoded, "{\"a\":1}\n{\"a\":2}");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = FileArchiver::start(FileArchiverConfig {
            dir: tmp.path().to_path_buf(),
            capacity: 1,
        });

        for i in 0..100 {
            archiver.archive_incoming("burst", &i.to_string());
        }
        archiver.close().await;

        // After close, calls are ignored
        archiver.archive_incoming("burst", "late");
    }

    #[test]
    fn test_safe_segment() {
        assert_eq!(safe_segment("../etc"), "___etc");
        assert_eq!(safe_segment("loads-v2"), "loads-v2");
        assert_eq!(safe_segment(""), "_");
    }
}
