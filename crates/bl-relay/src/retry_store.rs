//! Retry Store
//!
//! Durable holding area for payloads whose dispatch failed. A record stays
//! until the sweeper deletes it after a successful send.

use crate::{RelayError, Result};
use async_trait::async_trait;
use bl_common::RetryRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert the record, or overwrite the stored record with the same id
    async fn save(&self, record: &RetryRecord) -> Result<()>;

    /// All records, oldest failure first
    async fn list(&self) -> Result<Vec<RetryRecord>>;

    /// Remove a record. Removing an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

// ============================================================================
// File Store
// ============================================================================

/// One JSON file per record: `<dir>/<id>.json`
pub struct FileRetryStore {
    dir: PathBuf,
}

impl FileRetryStore {
    /// Open (creating if needed) the store directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(RelayError::Storage(format!("invalid retry record id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl RetryStore for FileRetryStore {
    async fn save(&self, record: &RetryRecord) -> Result<()> {
        let path = self.record_path(&record.id)?;
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec(record)?;
        fs::write(&tmp_path, &json).await?;
        fs::rename(&tmp_path, &path).await?;
        debug!(id = %record.id, channel = %record.channel, "Retry record saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RetryRecord>> {
        let mut records = Vec::new();
        for path in self.record_files().await? {
            let parsed = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<RetryRecord>(&bytes).map_err(RelayError::from),
                // Deleted by a concurrent sweep between read_dir and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(?path, error = %e, "Skipping unreadable retry record"),
            }
        }
        records.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.record_files().await?.len())
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory store for tests and ephemeral setups
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    records: RwLock<HashMap<String, RetryRecord>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn save(&self, record: &RetryRecord) -> Result<()> {
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RetryRecord>> {
        let mut records: Vec<RetryRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_file_store_save_list_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRetryStore::open(tmp.path().join("retry")).await.unwrap();

        let mut older = RetryRecord::new("loads", "[1]");
        older.failed_at = Utc::now() - Duration::minutes(5);
        let newer = RetryRecord::new("positions", "1\n2");

        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].payload, "1\n2");
        assert_eq!(store.count().await.unwrap(), 2);

        store.delete(&older.id).await.unwrap();
        store.delete(&older.id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_store_save_overwrites_same_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRetryStore::open(tmp.path()).await.unwrap();

        let mut record = RetryRecord::new("loads", "[1]");
        store.save(&record).await.unwrap();
        record.record_attempt(Utc::now());
        store.save(&record).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRetryStore::open(tmp.path()).await.unwrap();
        store.save(&RetryRecord::new("ok", "{}")).await.unwrap();
        std::fs::write(tmp.path().join("0-garbage.json"), b"nope").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].channel, "ok");
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRetryStore::open(tmp.path()).await.unwrap();
        assert!(store.delete("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRetryStore::new();
        let record = RetryRecord::new("loads", "[]");
        store.save(&record).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        store.delete(&record.id).await.unwrap();
        store.delete("missing").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
