//! Durable storage for connection records.
//!
//! The registry writes the whole record set on every mutation and reads it
//! back once at startup.
//!
//! | Store | Backing |
//! |-------|---------|
//! | [`MemoryRecordStore`] | In-process vector, for tests and ephemeral hosts |
//! | [`FileRecordStore`] | JSON file, replaced atomically on each save |

// ============================================================================
// Imports
// ============================================================================

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::record::ConnectionRecord;

// ============================================================================
// RecordStore
// ============================================================================

/// Whole-collection record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Reads every persisted record. An empty store yields an empty list.
    async fn load(&self) -> Result<Vec<ConnectionRecord>>;

    /// Replaces the persisted collection with `records`.
    async fn save(&self, records: &[ConnectionRecord]) -> Result<()>;
}

// ============================================================================
// MemoryRecordStore
// ============================================================================

/// Record store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<ConnectionRecord>>,
    saves: AtomicUsize,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with `records`, as if persisted earlier.
    #[must_use]
    pub fn with_records(records: Vec<ConnectionRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Current persisted collection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.records.lock().clone()
    }

    /// Number of saves so far.
    #[inline]
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self) -> Result<Vec<ConnectionRecord>> {
        Ok(self.snapshot())
    }

    async fn save(&self, records: &[ConnectionRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// ============================================================================
// FileRecordStore
// ============================================================================

/// Record store backed by one JSON file.
///
/// Saves write a temporary file next to the target and rename it over the
/// target, so a crash leaves either the old or the new collection.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    path: PathBuf,
}

impl FileRecordStore {
    /// Creates a store at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `bytes` to `path` through a temporary sibling file.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(path)
            .map_err(|e| Error::storage(format!("Failed to replace {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self) -> Result<Vec<ConnectionRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted records");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            Error::storage(format!("Corrupt record file {}: {e}", self.path.display()))
        })
    }

    async fn save(&self, records: &[ConnectionRecord]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        let count = records.len();

        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &bytes))
            .await
            .map_err(|e| Error::storage(format!("Record writer failed: {e}")))??;

        trace!(path = %self.path.display(), count, "Records persisted");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
