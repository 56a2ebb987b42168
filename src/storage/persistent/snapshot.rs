//! Point-in-time snapshots of the contact table.
//!
//! A snapshot holds every contact plus the logical clock. Compaction writes a
//! new snapshot, then truncates the WAL; on open the newest snapshot is loaded
//! and the WAL replayed on top of it.
//!
//! # Design
//! - Snapshots are numbered sequentially (`snapshot_00001.snap`, ...)
//! - Written to a temp file first, then atomically renamed into place
//! - Only the newest snapshot is kept once a new one is durable

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contact::Contact;

use super::codec::{self, FileKind};

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_EXT: &str = "snap";

/// Snapshot file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Number of contacts in the snapshot.
    pub contact_count: u64,
    /// Logical clock at the time of the snapshot.
    pub clock: u64,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// Snapshot payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Every stored contact, ascending by id.
    pub contacts: Vec<Contact>,
    /// Last issued logical clock value.
    pub clock: u64,
}

/// A durable snapshot file.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
    /// Sequential snapshot number.
    pub number: u32,
}

impl Snapshot {
    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the header only.
    pub fn read_header(&self) -> IoResult<SnapshotHeader> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader, FileKind::Snapshot)?;
        codec::decode(&mut reader)
    }

    /// Read the full snapshot.
    pub fn read_all(&self) -> IoResult<SnapshotData> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader, FileKind::Snapshot)?;
        let header: SnapshotHeader = codec::decode(&mut reader)?;
        let data: SnapshotData = codec::decode(&mut reader)?;
        if data.contacts.len() as u64 != header.contact_count {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "snapshot {} holds {} contacts, header says {}",
                    self.path.display(),
                    data.contacts.len(),
                    header.contact_count
                ),
            ));
        }
        Ok(data)
    }
}

/// Writes a snapshot to a temp file and renames it into place on finalize.
struct SnapshotWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    number: u32,
}

impl SnapshotWriter {
    fn write(final_path: PathBuf, number: u32, data: &SnapshotData) -> IoResult<Snapshot> {
        let temp_path = final_path.with_extension(format!("{SNAPSHOT_EXT}.tmp.{}", Uuid::new_v4()));
        let mut this = Self {
            temp_path: Some(temp_path.clone()),
            final_path,
            number,
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer, FileKind::Snapshot)?;
        let header = SnapshotHeader {
            contact_count: data.contacts.len() as u64,
            clock: data.clock,
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(data)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        this.finalize()
    }

    /// Commit point: after the rename the snapshot is durable.
    fn finalize(&mut self) -> IoResult<Snapshot> {
        let temp_path = self.temp_path.take().ok_or_else(|| {
            std::io::Error::other("snapshot writer already finalized")
        })?;
        fs::rename(&temp_path, &self.final_path)?;
        // The rename must be durable before the caller truncates the WAL.
        if let Some(parent) = self.final_path.parent() {
            sync_dir(parent)?;
        }
        Ok(Snapshot {
            path: self.final_path.clone(),
            number: self.number,
        })
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        // Best-effort cleanup of an unfinished temp file.
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Flush a directory's entries (creates, renames) to disk.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> IoResult<()> {
    File::open(dir)?.sync_all()
}

/// No directory handle to sync on this platform.
#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(_dir: &Path) -> IoResult<()> {
    Ok(())
}

fn parse_snapshot_number(path: &Path) -> Option<u32> {
    if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SNAPSHOT_PREFIX)?
        .parse()
        .ok()
}

/// Manages snapshot files for a database.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    latest: Option<Snapshot>,
    next_number: u32,
}

impl SnapshotManager {
    /// Open or create the snapshot directory, removing stale temp files.
    pub fn open(dir: &Path) -> IoResult<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            if let Some(parent) = dir.parent() {
                sync_dir(parent)?;
            }
        }

        let mut latest: Option<Snapshot> = None;
        let mut next_number = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if let Some(number) = parse_snapshot_number(&path) {
                next_number = next_number.max(number.saturating_add(1));
                if latest.as_ref().map_or(true, |s| number > s.number) {
                    latest = Some(Snapshot { path, number });
                }
                continue;
            }

            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".tmp."));
            if is_temp {
                tracing::debug!(path = %path.display(), "removing stale snapshot temp file");
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            latest,
            next_number,
        })
    }

    /// Directory holding the snapshots.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The newest snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Load the newest snapshot's data, or empty data when none exists.
    pub fn load_latest(&self) -> IoResult<SnapshotData> {
        match &self.latest {
            Some(snapshot) => snapshot.read_all(),
            None => Ok(SnapshotData::default()),
        }
    }

    /// Durably write a new snapshot and remove older ones.
    pub fn write(&mut self, data: &SnapshotData) -> IoResult<Snapshot> {
        let number = self.next_number;
        let path = self
            .dir
            .join(format!("{SNAPSHOT_PREFIX}{number:05}.{SNAPSHOT_EXT}"));
        let snapshot = SnapshotWriter::write(path, number, data)?;
        self.next_number = number.saturating_add(1);

        if let Some(previous) = self.latest.replace(snapshot.clone()) {
            if let Err(e) = fs::remove_file(previous.path()) {
                tracing::warn!(
                    path = %previous.path().display(),
                    error = %e,
                    "failed to remove superseded snapshot"
                );
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{ContactId, LinkPrecedence};
    use tempfile::tempdir;

    fn data(n: u64) -> SnapshotData {
        let now = Utc::now();
        let contacts = (1..=n)
            .map(|i| Contact {
                id: ContactId::new(i),
                email: Some(format!("c{i}@example.com")),
                phone_number: None,
                linked_id: None,
                link_precedence: LinkPrecedence::Primary,
                created_seq: i,
                created_at: now,
                updated_at: now,
            })
            .collect();
        SnapshotData { contacts, clock: n }
    }

    #[test]
    fn test_open_empty() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::open(dir.path()).unwrap();
        assert!(manager.latest().is_none());
        assert!(manager.load_latest().unwrap().contacts.is_empty());
    }

    #[test]
    fn test_write_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut manager = SnapshotManager::open(dir.path()).unwrap();
            let snap = manager.write(&data(3)).unwrap();
            assert_eq!(snap.number, 1);
            assert!(snap.path().to_string_lossy().contains("snapshot_00001"));
            assert_eq!(snap.read_header().unwrap().contact_count, 3);
        }

        let manager = SnapshotManager::open(dir.path()).unwrap();
        let loaded = manager.load_latest().unwrap();
        assert_eq!(loaded.contacts.len(), 3);
        assert_eq!(loaded.clock, 3);
    }

    #[test]
    fn test_newer_snapshot_replaces_older() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path()).unwrap();
        let first = manager.write(&data(1)).unwrap();
        let second = manager.write(&data(2)).unwrap();

        assert!(!first.path().exists());
        assert!(second.path().exists());
        assert_eq!(manager.latest().unwrap().number, 2);

        let reopened = SnapshotManager::open(dir.path()).unwrap();
        assert_eq!(reopened.load_latest().unwrap().contacts.len(), 2);
    }

    #[test]
    fn test_written_snapshot_is_listed_by_a_fresh_manager() {
        let dir = tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        let mut manager = SnapshotManager::open(&snapshots).unwrap();
        let written = manager.write(&data(2)).unwrap();

        // Only the renamed file remains; no temp file is left beside it.
        let names: Vec<_> = fs::read_dir(&snapshots)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["snapshot_00001.snap"]);

        let reopened = SnapshotManager::open(&snapshots).unwrap();
        assert_eq!(reopened.latest().unwrap().path(), written.path());
        sync_dir(&snapshots).unwrap();
    }

    #[test]
    fn test_stale_temp_files_are_removed() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("snapshot_00001.snap.tmp.leftover");
        fs::write(&stale, b"partial").unwrap();

        let manager = SnapshotManager::open(dir.path()).unwrap();
        assert!(!stale.exists());
        assert!(manager.latest().is_none());
    }
}
