//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Each committed transaction is written as exactly one WAL record, so a
//! transaction is either fully replayed or not at all.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte][KIND: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId, LinkPrecedence};

use super::codec::{self, FileKind, HEADER_LEN};

/// One mutation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    /// A contact was created (full post-creation state).
    ContactCreate {
        contact: Contact,
    },
    /// A contact's linkage was set to these absolute values.
    ContactLink {
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: DateTime<Utc>,
    },
}

/// A single committed transaction in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// Mutations, in the order they were applied.
    pub ops: Vec<WalOp>,
}

fn poisoned(context: &'static str) -> std::io::Error {
    std::io::Error::other(format!("poisoned lock: {context}"))
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
    /// Set after a failed append: the file may end in a partial record.
    failed: bool,
}

fn write_record(state: &mut WalState, bytes: &[u8], sync: bool) -> IoResult<()> {
    state.writer.write_all(bytes)?;
    state.writer.flush()?;
    if sync {
        state.writer.get_ref().sync_data()?;
    }
    Ok(())
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

/// Result of scanning a WAL file for its valid prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WalScan {
    last_sequence: u64,
    valid_len: u64,
    torn_tail: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned; a torn final record (crash mid-append) is
    /// cut off so new appends start on a record boundary. A checksum failure
    /// anywhere is reported as an error.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        // A file shorter than the header never held a committed entry.
        let exists = path.exists() && std::fs::metadata(path)?.len() >= HEADER_LEN;

        let sequence = if exists {
            let scan = Self::scan(path)?;
            if scan.torn_tail {
                tracing::warn!(
                    path = %path.display(),
                    last_sequence = scan.last_sequence,
                    valid_len = scan.valid_len,
                    "WAL has a torn tail record; truncating to last complete entry"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            scan.last_sequence
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file, FileKind::Wal)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
                failed: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalState>> {
        self.state.lock().map_err(|_| poisoned("wal"))
    }

    /// Append one committed transaction.
    ///
    /// Returns the sequence number assigned to this entry.
    pub fn append(&self, ops: Vec<WalOp>) -> IoResult<u64> {
        let mut state = self.lock()?;
        if state.failed {
            return Err(std::io::Error::other(
                "WAL is unusable after a failed append; reopen the database",
            ));
        }

        let candidate = state.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            ops,
        };
        let encoded = codec::encode(&entry)?;

        if let Err(e) = write_record(&mut state, &encoded, self.sync_on_write) {
            state.failed = true;
            return Err(e);
        }

        state.sequence = candidate;
        Ok(candidate)
    }

    /// Iterate over all complete entries in the WAL.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drop every entry, leaving only the header.
    ///
    /// Only call this after the state covered by the log is in a durable snapshot.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        codec::write_header(&mut file, FileKind::Wal)?;
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.sequence = 0;
        state.failed = false;
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<WalScan> {
        let mut iter = WalIterator::new(path)?;
        let mut scan = WalScan {
            last_sequence: 0,
            valid_len: HEADER_LEN,
            torn_tail: false,
        };

        loop {
            match iter.next_entry() {
                Ok(Some(entry)) => {
                    scan.last_sequence = entry.sequence;
                    scan.valid_len = iter.position()?;
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    scan.torn_tail = true;
                    break;
                }
                Err(e) => {
                    return Err(std::io::Error::new(
                        e.kind(),
                        format!("WAL corrupted after sequence {}: {e}", scan.last_sequence),
                    ));
                }
            }
        }
        Ok(scan)
    }
}

/// Iterator over WAL entries.
///
/// Stops silently at a torn final record; yields an error for corrupted records.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader, FileKind::Wal)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn next_entry(&mut self) -> IoResult<Option<WalEntry>> {
        if self.position()? >= self.file_size {
            return Ok(None);
        }
        codec::decode(&mut self.reader).map(Some)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
