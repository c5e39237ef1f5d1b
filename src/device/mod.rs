//! Device Module
//!
//! Raw sector gateways for the backing and cache devices.
//!
//! ## Responsibilities
//! - Positional byte reads/writes (pread/pwrite semantics, no shared cursor)
//! - Flush to stable storage
//! - Discard
//!
//! Offsets and lengths are in bytes; the request layer only ever issues
//! sector-aligned ranges.

mod file;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CacheError, Result};
use crate::extent::{sectors_to_bytes, PointerRecord};

pub use file::FileDevice;
pub use memory::{DeviceCounters, MemoryDevice};

/// Async block device gateway.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Total size in bytes
    fn len_bytes(&self) -> u64;

    /// Read exactly `len` bytes at `offset`
    async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes>;

    /// Write all of `data` at `offset`
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Flush volatile write caches
    async fn flush(&self) -> Result<()>;

    /// Drop the contents of `[offset, offset + len)`
    async fn discard(&self, offset: u64, len: u64) -> Result<()>;
}

/// Bounds check shared by the implementations
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CacheError::OutOfRange { offset, len, size }),
    }
}

/// Read `record`'s bytes from the cache device.
///
/// A checksummed record is verified over the whole run it was written with,
/// then cut down to its own range.
pub async fn read_record(cache: &dyn BlockDevice, record: &PointerRecord) -> Result<Bytes> {
    let Some(sum) = record.checksum else {
        return cache
            .read_at(record.cache_byte_offset(), record.key.byte_len())
            .await;
    };

    let run_start = match record.cache_offset.checked_sub(sum.lead) {
        Some(start) if sum.lead + record.key.len <= sum.len => start,
        _ => {
            return Err(CacheError::ChecksumMismatch {
                sector: record.cache_offset,
            })
        }
    };
    let run = cache
        .read_at(sectors_to_bytes(run_start), sectors_to_bytes(sum.len))
        .await?;
    if crc32fast::hash(&run) != sum.crc {
        return Err(CacheError::ChecksumMismatch { sector: run_start });
    }

    let from = sectors_to_bytes(sum.lead) as usize;
    Ok(run.slice(from..from + record.key.byte_len() as usize))
}
