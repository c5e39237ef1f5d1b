//! Extent Module
//!
//! Logical ranges and the pointer records that map them onto the cache device.
//!
//! ## Units
//! All ranges are in 512-byte sectors and half-open: `[offset, offset + len)`.
//! Adjacency is `a.end() == b.start()`, clipping is a pair of `max`/`min`.
//!
//! ```text
//!  logical (inode 7)   0        8        16       24
//!                      ├────────┼────────┼────────┤
//!  PointerRecord              [8 ── 16)
//!                              │
//!                              ▼
//!  cache device         ...  [bucket 3, sector 3080 ── 3088) ...
//! ```

mod key;
mod record;

pub use key::ExtentKey;
pub use record::{
    BucketRef, DataChecksum, PointerRecord, CACHE_DEVICE_ID, PLACEHOLDER_DEVICE_ID,
};

/// log2 of the sector size
pub const SECTOR_SHIFT: u32 = 9;

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Convert a sector count or offset to bytes
#[inline]
pub fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors << SECTOR_SHIFT
}

/// Convert a sector-aligned byte count or offset to sectors
#[inline]
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}
