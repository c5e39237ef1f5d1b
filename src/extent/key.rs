//! Extent keys
//!
//! Half-open logical sector ranges within one stream/inode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

use super::{sectors_to_bytes, SECTOR_SIZE};

/// A contiguous logical sector range `[offset, offset + len)` of one inode.
///
/// Ordered by `(inode, offset)`; the index keeps committed keys of one inode
/// non-overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtentKey {
    pub inode: u64,
    pub offset: u64,
    pub len: u64,
}

impl ExtentKey {
    pub fn new(inode: u64, offset: u64, len: u64) -> Self {
        Self { inode, offset, len }
    }

    /// Build a key from a byte range, rejecting anything not sector aligned
    pub fn from_bytes(inode: u64, byte_offset: u64, byte_len: u64) -> Result<Self> {
        if byte_offset % SECTOR_SIZE != 0 || byte_len % SECTOR_SIZE != 0 {
            return Err(CacheError::InvalidRequest(format!(
                "byte range {}+{} is not sector aligned",
                byte_offset, byte_len
            )));
        }
        Ok(Self::new(
            inode,
            byte_offset / SECTOR_SIZE,
            byte_len / SECTOR_SIZE,
        ))
    }

    /// Build a key from half-open sector bounds
    pub fn from_range(inode: u64, start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self::new(inode, start, end - start)
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_offset(&self) -> u64 {
        sectors_to_bytes(self.offset)
    }

    pub fn byte_len(&self) -> u64 {
        sectors_to_bytes(self.len)
    }

    pub fn overlaps(&self, other: &ExtentKey) -> bool {
        self.inode == other.inode && self.start() < other.end() && other.start() < self.end()
    }

    /// Does `self` fully contain `other`?
    pub fn contains(&self, other: &ExtentKey) -> bool {
        self.inode == other.inode && self.start() <= other.start() && other.end() <= self.end()
    }

    /// Is `next` the immediate continuation of `self`?
    pub fn is_adjacent(&self, next: &ExtentKey) -> bool {
        self.inode == next.inode && self.end() == next.start()
    }

    pub fn intersect(&self, other: &ExtentKey) -> Option<ExtentKey> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.start().max(other.start());
        let end = self.end().min(other.end());
        Some(ExtentKey::from_range(self.inode, start, end))
    }

    /// Both offset and length are multiples of `block_sectors`
    pub fn is_aligned(&self, block_sectors: u64) -> bool {
        let mask = block_sectors - 1;
        self.offset & mask == 0 && self.len & mask == 0
    }
}

impl fmt::Display for ExtentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{},{})", self.inode, self.start(), self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open_overlap() {
        let a = ExtentKey::new(1, 0, 8);
        let b = ExtentKey::new(1, 8, 8);
        assert!(!a.overlaps(&b));
        assert!(a.is_adjacent(&b));

        let c = ExtentKey::new(1, 7, 2);
        assert!(a.overlaps(&c));
        assert_eq!(a.intersect(&c), Some(ExtentKey::new(1, 7, 1)));
    }

    #[test]
    fn test_different_inodes_never_overlap() {
        let a = ExtentKey::new(1, 0, 8);
        let b = ExtentKey::new(2, 0, 8);
        assert!(!a.overlaps(&b));
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn test_from_bytes_requires_sector_alignment() {
        assert_eq!(
            ExtentKey::from_bytes(3, 4096, 8192).unwrap(),
            ExtentKey::new(3, 8, 16)
        );
        assert!(ExtentKey::from_bytes(3, 100, 512).is_err());
        assert!(ExtentKey::from_bytes(3, 0, 700).is_err());
    }

    #[test]
    fn test_block_alignment() {
        assert!(ExtentKey::new(0, 8, 16).is_aligned(8));
        assert!(!ExtentKey::new(0, 4, 8).is_aligned(8));
        assert!(!ExtentKey::new(0, 8, 4).is_aligned(8));
    }
}
