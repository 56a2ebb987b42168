//! Binary framing for WAL and snapshot files.
//!
//! Every file starts with a header identifying its kind; every record is:
//! - JSON payload (serde)
//! - length-prefixed for framing
//! - CRC32 checksum for corruption detection
//! - version byte for forward compatibility

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current record format version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying identity-reconciler files.
pub const MAGIC: [u8; 4] = *b"IDRC";

/// Header length in bytes: magic + version + kind.
pub const HEADER_LEN: u64 = 6;

/// Upper bound on a single record (64 MiB).
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Which kind of file a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Wal = 1,
    Snapshot = 2,
}

impl FileKind {
    fn from_byte(byte: u8) -> IoResult<Self> {
        match byte {
            1 => Ok(Self::Wal),
            2 => Ok(Self::Snapshot),
            other => Err(IoError::new(
                ErrorKind::InvalidData,
                format!("unknown file kind byte: {other}"),
            )),
        }
    }
}

/// Serializes a record with framing and checksum.
///
/// Format:
/// ```text
/// [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
/// ```
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    if data.len() > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {} exceeds maximum {MAX_RECORD_SIZE}", data.len()),
        ));
    }

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Deserializes one record, verifying its checksum.
///
/// # Errors
/// - `UnexpectedEof` if the record is truncated (torn write)
/// - `InvalidData` on checksum mismatch, unsupported version, or bad JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Write a file header.
pub fn write_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION, kind as u8])?;
    Ok(())
}

/// Read and validate a file header of the expected kind.
pub fn read_header(reader: &mut impl Read, expected: FileKind) -> IoResult<()> {
    let mut header = [0u8; 6];
    reader.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {:?}", &header[..4]),
        ));
    }
    if header[4] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported file version: {}", header[4]),
        ));
    }
    let kind = FileKind::from_byte(header[5])?;
    if kind != expected {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("wrong file kind: expected {expected:?}, got {kind:?}"),
        ));
    }
    Ok(())
}
