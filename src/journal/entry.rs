//! Journal entry definitions
//!
//! Defines the structure of individual journal entries and their framing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::extent::{BucketRef, ExtentKey, PointerRecord};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// The index mutation
    pub op: JournalOp,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Index mutations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Commit a batch of pointer records
    Insert { records: Vec<PointerRecord> },

    /// Drop everything cached for an extent
    Invalidate { extent: ExtentKey },

    /// A bucket was opened at a new generation. Records logged against any
    /// other generation of it are stale from here on.
    Reuse { bucket: BucketRef },
}

impl JournalEntry {
    pub fn new(lsn: u64, op: JournalOp) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { lsn, op, timestamp }
    }

    /// Header + payload, ready to append
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        let len = u32::try_from(data.len()).map_err(|_| {
            CacheError::JournalWrite(format!("entry of {} bytes is too large", data.len()))
        })?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
        frame.extend_from_slice(&self.lsn.to_le_bytes());
        frame.extend_from_slice(&Self::compute_crc(&data).to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    /// Validate and decode a payload whose header has already been read
    pub fn decode(lsn: u64, crc: u32, data: &[u8]) -> Result<Self> {
        let actual = Self::compute_crc(data);
        if actual != crc {
            return Err(CacheError::JournalCorruption(format!(
                "CRC mismatch at LSN {}: expected {:08x}, got {:08x}",
                lsn, crc, actual
            )));
        }

        let entry: JournalEntry = bincode::deserialize(data)?;
        if entry.lsn != lsn {
            return Err(CacheError::JournalCorruption(format!(
                "header LSN {} does not match payload LSN {}",
                lsn, entry.lsn
            )));
        }
        Ok(entry)
    }

    pub fn compute_crc(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}
