//! Persistent storage backend for contacts.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL), one record per committed transaction
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Snapshots so the WAL can be compacted
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  PersistentContactStore                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────┐  ┌─────────────┐  │
//! │  │ ContactIndex    │  │ WriteAheadLog    │  │ Snapshots   │  │
//! │  │ (in-memory)     │  │ (append-only)    │  │ (compacted) │  │
//! │  └─────────────────┘  └────────┬─────────┘  └──────┬──────┘  │
//! │                                └──────────┬────────┘         │
//! │                                ┌──────────┴─────────┐        │
//! │                                │  FileLock (flock)  │        │
//! │                                └────────────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use snapshot::{Snapshot, SnapshotData, SnapshotHeader, SnapshotManager};
pub use store::{CompactionResult, PersistentContactStore};
pub use wal::{WalEntry, WalOp, WriteAheadLog};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::traits::StorageError;

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size (bytes) after which a commit triggers compaction.
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Check limits, returning the config unchanged when valid.
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a persistent contact database at the given directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If snapshot loading or WAL replay finds corruption
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use identity_reconciler::storage::open_database;
/// use identity_reconciler::IdentityResolver;
///
/// let store = open_database("./contacts.db", None)?;
/// let resolver = IdentityResolver::new(Arc::new(store));
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentContactStore, StorageError> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(PersistentConfig::default().validate().is_ok());

        let err = PersistentConfig {
            max_wal_size: 10,
            sync_on_write: false,
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("max_wal_size"));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let cfg: PersistentConfig = toml::from_str("sync_on_write = false").unwrap();
        assert!(!cfg.sync_on_write);
        assert_eq!(cfg.max_wal_size, PersistentConfig::default().max_wal_size);
    }
}
