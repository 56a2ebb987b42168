//! Persistent contact store.
//!
//! The store wraps:
//! - An in-memory `ContactIndex` for fast reads
//! - WAL integration for durable writes
//! - A snapshot manager for compacted state

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};

use chrono::Utc;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::storage::index::{ContactIndex, UndoEntry};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

use super::file_lock::FileLock;
use super::snapshot::{SnapshotData, SnapshotManager};
use super::wal::{WalOp, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "contacts.wal";
const SNAPSHOT_DIR: &str = "snapshots";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of contacts written to the snapshot.
    pub contacts_compacted: u64,
    /// Path to the new snapshot file (if created).
    pub snapshot_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable contact store backed by a WAL and snapshots.
///
/// Only one process may open a database directory at a time.
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    snapshots: Mutex<SnapshotManager>,
    index: RwLock<ContactIndex>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentContactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContactStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentContactStore {
    /// Open or create a database directory.
    ///
    /// Loads the newest snapshot, then replays the WAL on top of it.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create database directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("failed to acquire lock", e))?;

        let snapshots = SnapshotManager::open(&dir.join(SNAPSHOT_DIR))
            .map_err(|e| io_err("failed to open snapshots", e))?;
        let data = snapshots
            .load_latest()
            .map_err(|e| io_err("failed to load snapshot", e))?;
        let mut index = ContactIndex::from_contacts(data.contacts);
        index.observe_clock(data.clock);

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", e))?;
        let replayed = replay_wal(&wal, &mut index)?;

        tracing::info!(
            dir = %dir.display(),
            contacts = index.len(),
            replayed_entries = replayed,
            snapshot = snapshots.latest().map(|s| s.number),
            "opened contact database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            snapshots: Mutex::new(snapshots),
            index: RwLock::new(index),
            config,
        })
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of every stored contact, ascending by id.
    pub fn all(&self) -> Result<Vec<Contact>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("contact.all"))?;
        Ok(index.contacts().cloned().collect())
    }

    /// Get the current WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("failed to stat WAL", e))
    }

    /// Path of the newest snapshot, if one has been written.
    pub fn latest_snapshot(&self) -> Result<Option<PathBuf>, StorageError> {
        let snapshots = self.snapshots.lock().map_err(|_| lock_err("snapshots"))?;
        Ok(snapshots.latest().map(|s| s.path().to_path_buf()))
    }

    /// Compact the WAL into a snapshot.
    ///
    /// Writes every contact to a new snapshot, then truncates the WAL. If this
    /// fails partway, the WAL still holds everything and is replayed on open.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        // A read guard is enough to keep transactions out.
        let index = self.index.read().map_err(|_| lock_err("contact.compact"))?;
        self.compact_locked(&index)
    }

    fn compact_locked(&self, index: &ContactIndex) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal_size()?;
        let current_seq = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", e))?;
        if current_seq == 0 {
            return Ok(CompactionResult {
                contacts_compacted: 0,
                snapshot_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            contacts: index.contacts().cloned().collect(),
            clock: index.clock(),
        };

        let snapshot = {
            let mut snapshots = self.snapshots.lock().map_err(|_| lock_err("snapshots"))?;
            snapshots
                .write(&data)
                .map_err(|e| io_err("failed to write snapshot", e))?
        };
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", e))?;

        let result = CompactionResult {
            contacts_compacted: data.contacts.len() as u64,
            snapshot_path: Some(snapshot.path().to_path_buf()),
            wal_size_before,
            wal_size_after: self.wal_size()?,
        };
        tracing::info!(
            contacts = result.contacts_compacted,
            wal_entries = current_seq,
            wal_size_before = result.wal_size_before,
            snapshot = snapshot.number,
            "compacted contact WAL"
        );
        Ok(result)
    }

    fn maybe_compact(&self, index: &ContactIndex) {
        let size = match self.wal.size_bytes() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "failed to stat WAL after commit");
                return;
            }
        };
        if size <= self.config.max_wal_size {
            return;
        }
        // The commit is already durable; a failed compaction only delays the next one.
        if let Err(e) = self.compact_locked(index) {
            tracing::warn!(error = %e, wal_size = size, "automatic compaction failed");
        }
    }
}

fn replay_wal(wal: &WriteAheadLog, index: &mut ContactIndex) -> Result<u64, StorageError> {
    let iter = wal.iter().map_err(|e| io_err("failed to iterate WAL", e))?;

    let mut count = 0u64;
    for entry in iter {
        let entry = entry.map_err(|e| io_err("corrupted WAL entry", e))?;
        for op in entry.ops {
            match op {
                WalOp::ContactCreate { contact } => index.apply_contact(contact),
                WalOp::ContactLink {
                    id,
                    precedence,
                    linked_id,
                    updated_at,
                } => index
                    .set_linkage(id, precedence, linked_id, updated_at)
                    .map_err(|e| {
                        StorageError::BackendError(format!(
                            "WAL entry {} references unknown contact: {e}",
                            entry.sequence
                        ))
                    })?,
            }
        }
        count += 1;
    }

    if count > 0 {
        tracing::debug!(entries = count, "replayed WAL entries");
    }
    Ok(count)
}

impl ContactStore for PersistentContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let index = self.index.write().map_err(|_| lock_err("contact.begin"))?;
        Ok(Box::new(PersistentTransaction {
            store: self,
            index,
            undo: Vec::new(),
            ops: Vec::new(),
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("contact.get"))?;
        Ok(index.get(id).cloned())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("contact.len"))?;
        Ok(index.len())
    }
}

/// Exclusive transaction over the persistent index.
///
/// Mutations are applied to the index immediately and collected as WAL ops.
/// Commit writes them as a single WAL record; anything else rolls them back.
struct PersistentTransaction<'a> {
    store: &'a PersistentContactStore,
    index: RwLockWriteGuard<'a, ContactIndex>,
    undo: Vec<UndoEntry>,
    ops: Vec<WalOp>,
}

impl ContactTransaction for PersistentTransaction<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        Ok(self.index.find_by_email_or_phone(email, phone_number))
    }

    fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError> {
        Ok(self.index.find_by_ids_or_linked_ids(ids))
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        let (created, undo) = self.index.create(contact, Utc::now())?;
        self.undo.push(undo);
        self.ops.push(WalOp::ContactCreate {
            contact: created.clone(),
        });
        Ok(created)
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        if let Some(undo) = self.index.update_linkage(id, precedence, linked_id, now)? {
            self.undo.push(undo);
            self.ops.push(WalOp::ContactLink {
                id,
                precedence,
                linked_id,
                updated_at: now,
            });
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.ops.is_empty() {
            self.undo.clear();
            return Ok(());
        }

        let ops = std::mem::take(&mut self.ops);
        let op_count = ops.len();
        // On failure the box drops here and the undo log reverts the index.
        let sequence = self
            .store
            .wal
            .append(ops)
            .map_err(|e| io_err("failed to append WAL entry", e))?;
        self.undo.clear();
        tracing::trace!(sequence, ops = op_count, "committed contact transaction");

        self.store.maybe_compact(&self.index);
        Ok(())
    }
}

impl Drop for PersistentTransaction<'_> {
    fn drop(&mut self) {
        while let Some(entry) = self.undo.pop() {
            if let Err(e) = self.index.undo(entry) {
                tracing::error!(error = %e, "failed to roll back persistent contact mutation");
            }
        }
    }
}
