//! Queue Snapshot Store
//!
//! Persists the outgoing queue as one JSON file per message. A snapshot is
//! written into a staging directory and swapped in by rename, so a crash while
//! writing leaves the previous snapshot readable.

use crate::Result;
use bl_common::OutgoingMessage;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub struct SnapshotStore {
    live_dir: PathBuf,
    staging_dir: PathBuf,
    previous_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let live_dir: PathBuf = dir.into();
        let staging_dir = sibling(&live_dir, "staging");
        let previous_dir = sibling(&live_dir, "previous");
        Self {
            live_dir,
            staging_dir,
            previous_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.live_dir
    }

    /// Replace the stored snapshot with `messages`. Returns the number written.
    pub async fn save(&self, messages: &[OutgoingMessage]) -> Result<usize> {
        if fs::try_exists(&self.staging_dir).await? {
            fs::remove_dir_all(&self.staging_dir).await?;
        }
        fs::create_dir_all(&self.staging_dir).await?;

        for (seq, message) in messages.iter().enumerate() {
            let json = serde_json::to_vec(message)?;
            fs::write(self.staging_dir.join(format!("{:010}.json", seq)), json).await?;
        }

        if fs::try_exists(&self.previous_dir).await? {
            fs::remove_dir_all(&self.previous_dir).await?;
        }
        if fs::try_exists(&self.live_dir).await? {
            fs::rename(&self.live_dir, &self.previous_dir).await?;
        }
        fs::rename(&self.staging_dir, &self.live_dir).await?;
        if fs::try_exists(&self.previous_dir).await? {
            fs::remove_dir_all(&self.previous_dir).await?;
        }

        debug!(dir = ?self.live_dir, count = messages.len(), "Queue snapshot written");
        Ok(messages.len())
    }

    /// Read the last complete snapshot in stored order. Unreadable files are skipped.
    pub async fn load(&self) -> Result<Vec<OutgoingMessage>> {
        let dir = if fs::try_exists(&self.live_dir).await? {
            &self.live_dir
        } else if fs::try_exists(&self.previous_dir).await? {
            // Crashed between the two renames of a save
            warn!(dir = ?self.previous_dir, "Live snapshot missing, loading previous snapshot");
            &self.previous_dir
        } else {
            return Ok(Vec::new());
        };

        let mut files = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let mut messages = Vec::with_capacity(files.len());
        for path in files {
            match read_message(&path).await {
                Ok(message) => messages.push(message),
                Err(e) => warn!(?path, error = %e, "Skipping unreadable queue snapshot record"),
            }
        }

        info!(dir = ?dir, count = messages.len(), "Loaded queue snapshot");
        Ok(messages)
    }
}

async fn read_message(path: &Path) -> Result<OutgoingMessage> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "queue".to_string());
    dir.with_file_name(format!("{}.{}", name, suffix))
}
