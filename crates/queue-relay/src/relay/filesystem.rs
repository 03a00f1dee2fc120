//! # Filesystem Relay Store
//!
//! Keeps one JSON file per record under `pending/` and `deadletter/` of a
//! base directory. File names start with the zero-padded local sequence so a
//! directory listing sorts in append order.

use super::store::{RelayRecord, RelayStore, RelayStoreError};
use crate::message::{EntityPath, Message};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

const PENDING_DIR: &str = "pending";
const DEAD_LETTER_DIR: &str = "deadletter";

fn io_error(path: &Path, error: std::io::Error) -> RelayStoreError {
    RelayStoreError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

/// Filesystem-based relay store
///
/// # Examples
///
/// ```no_run
/// use queue_relay::relay::FilesystemRelayStore;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FilesystemRelayStore::open(PathBuf::from("./data/relay")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FilesystemRelayStore {
    base_path: PathBuf,
    // Next local sequence; holding the lock serializes writers
    next_sequence: Mutex<u64>,
}

impl FilesystemRelayStore {
    /// Open (or create) a store rooted at `base_path`.
    ///
    /// Leftover temporary files from an interrupted write are removed, and
    /// local sequence numbering resumes after the highest stored record.
    pub async fn open(base_path: PathBuf) -> Result<Self, RelayStoreError> {
        let mut highest = 0;
        for dir in [PENDING_DIR, DEAD_LETTER_DIR] {
            let dir_path = base_path.join(dir);
            fs::create_dir_all(&dir_path)
                .await
                .map_err(|e| io_error(&dir_path, e))?;

            for record in read_records(&dir_path, true).await? {
                highest = highest.max(record.local_sequence);
            }
        }

        info!(path = %base_path.display(), next_sequence = highest + 1, "Relay store opened");
        Ok(Self {
            base_path,
            next_sequence: Mutex::new(highest + 1),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, dir: &str, record: &RelayRecord) -> PathBuf {
        self.base_path
            .join(dir)
            .join(format!("{:020}-{}.json", record.local_sequence, record.id))
    }
}

/// Write via a temporary file and rename, so readers never see a partial record
async fn write_atomic(path: &Path, record: &RelayRecord) -> Result<(), RelayStoreError> {
    let json = serde_json::to_vec_pretty(record).map_err(|e| RelayStoreError::Serialization {
        message: format!("Failed to serialize relay record: {}", e),
    })?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| io_error(&temp_path, e))?;
    file.write_all(&json)
        .await
        .map_err(|e| io_error(&temp_path, e))?;
    file.flush().await.map_err(|e| io_error(&temp_path, e))?;
    file.sync_all().await.map_err(|e| io_error(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| io_error(path, e))?;
    match path.parent() {
        Some(dir) => sync_dir(dir).await,
        None => Ok(()),
    }
}

/// Flush directory entries (renames, removals) to disk
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), RelayStoreError> {
    let handle = fs::File::open(dir).await.map_err(|e| io_error(dir, e))?;
    handle.sync_all().await.map_err(|e| io_error(dir, e))
}

/// Directories cannot be opened for syncing here; entries are flushed by the OS
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), RelayStoreError> {
    Ok(())
}

async fn remove_durably(path: &Path) -> Result<(), RelayStoreError> {
    fs::remove_file(path).await.map_err(|e| io_error(path, e))?;
    match path.parent() {
        Some(dir) => sync_dir(dir).await,
        None => Ok(()),
    }
}

/// Read every record in `dir`, sorted by local sequence
async fn read_records(dir: &Path, clean_temp_files: bool) -> Result<Vec<RelayRecord>, RelayStoreError> {
    let mut records = Vec::new();
    let mut read_dir = fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;

    while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_error(dir, e))? {
        let entry_path = entry.path();
        match entry_path.extension().and_then(|s| s.to_str()) {
            Some("json") => {
                let json = fs::read_to_string(&entry_path)
                    .await
                    .map_err(|e| io_error(&entry_path, e))?;
                let record: RelayRecord =
                    serde_json::from_str(&json).map_err(|e| RelayStoreError::Corrupt {
                        path: entry_path.display().to_string(),
                        message: e.to_string(),
                    })?;
                records.push(record);
            }
            Some("tmp") if clean_temp_files => {
                debug!(path = %entry_path.display(), "Removing interrupted relay write");
                fs::remove_file(&entry_path)
                    .await
                    .map_err(|e| io_error(&entry_path, e))?;
            }
            _ => {}
        }
    }

    records.sort_by_key(|r| r.local_sequence);
    Ok(records)
}

#[async_trait]
impl RelayStore for FilesystemRelayStore {
    async fn append(
        &self,
        destination: &EntityPath,
        message: Message,
    ) -> Result<RelayRecord, RelayStoreError> {
        let mut next_sequence = self.next_sequence.lock().await;
        let record = RelayRecord::new(*next_sequence, destination.clone(), message);

        write_atomic(&self.record_path(PENDING_DIR, &record), &record).await?;
        *next_sequence += 1;
        Ok(record)
    }

    async fn update(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let _writer = self.next_sequence.lock().await;
        let path = self.record_path(PENDING_DIR, record);
        if !path.exists() {
            return Err(RelayStoreError::NotFound { id: record.id });
        }
        write_atomic(&path, record).await
    }

    async fn remove(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let _writer = self.next_sequence.lock().await;
        let path = self.record_path(PENDING_DIR, record);
        if !path.exists() {
            return Err(RelayStoreError::NotFound { id: record.id });
        }
        remove_durably(&path).await
    }

    async fn live(&self) -> Result<Vec<RelayRecord>, RelayStoreError> {
        read_records(&self.base_path.join(PENDING_DIR), false).await
    }

    async fn move_to_dead_letter(&self, record: &RelayRecord) -> Result<(), RelayStoreError> {
        let _writer = self.next_sequence.lock().await;
        let pending_path = self.record_path(PENDING_DIR, record);
        if !pending_path.exists() {
            return Err(RelayStoreError::NotFound { id: record.id });
        }

        // Dead-letter copy first; a crash in between leaves the record live, never lost
        write_atomic(&self.record_path(DEAD_LETTER_DIR, record), record).await?;
        remove_durably(&pending_path).await
    }

    async fn dead_letters(&self) -> Result<Vec<RelayRecord>, RelayStoreError> {
        read_records(&self.base_path.join(DEAD_LETTER_DIR), false).await
    }
}

#[cfg(test)]
#[path = "filesystem_tests.rs"]
mod tests;
