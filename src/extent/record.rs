//! Pointer records
//!
//! Index entries mapping a logical extent onto a cache-device location.

use serde::{Deserialize, Serialize};

use super::{sectors_to_bytes, ExtentKey};

/// Device id of the (single) cache device
pub const CACHE_DEVICE_ID: u32 = 0;

/// Device id marking a read-miss placeholder. Never readable.
pub const PLACEHOLDER_DEVICE_ID: u32 = u32::MAX;

/// Generation-stamped handle to a bucket in the allocator's arena.
///
/// The generation is bumped every time the bucket is reused, so a record
/// holding an older generation is stale without any pointer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketRef {
    pub index: u32,
    pub gen: u8,
}

/// crc32 over a run of cache sectors written together.
///
/// The run may reach past the record on either side once the record has been
/// clipped, so it is described relative to the record's cache offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChecksum {
    pub crc: u32,

    /// Sectors the covered run starts before the record's `cache_offset`
    pub lead: u64,

    /// Length of the covered run in sectors
    pub len: u64,
}

/// Extent key plus where its data lives on the cache device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRecord {
    pub key: ExtentKey,

    /// Cache device id, or `PLACEHOLDER_DEVICE_ID`
    pub dev: u32,

    /// Sector on the cache device holding `key.offset`
    pub cache_offset: u64,

    /// Data exists only on the cache device
    pub dirty: bool,

    /// crc32 of the bytes originally written for this record, if computed
    pub checksum: Option<DataChecksum>,

    pub bucket: BucketRef,
}

impl PointerRecord {
    pub fn new(key: ExtentKey, cache_offset: u64, bucket: BucketRef, dirty: bool) -> Self {
        Self {
            key,
            dev: CACHE_DEVICE_ID,
            cache_offset,
            dirty,
            checksum: None,
            bucket,
        }
    }

    /// Reserve `key` for an in-flight read-miss fill. `token` makes each
    /// reservation distinguishable so a later fill can tell whether its own
    /// placeholder is still there.
    pub fn placeholder(key: ExtentKey, token: u64) -> Self {
        Self {
            key,
            dev: PLACEHOLDER_DEVICE_ID,
            cache_offset: token,
            dirty: false,
            checksum: None,
            bucket: BucketRef { index: u32::MAX, gen: 0 },
        }
    }

    /// Attach the crc32 of exactly this record's bytes
    pub fn with_checksum(mut self, crc: u32) -> Self {
        self.checksum = Some(DataChecksum {
            crc,
            lead: 0,
            len: self.key.len,
        });
        self
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.dev == PLACEHOLDER_DEVICE_ID
    }

    /// Byte offset on the cache device
    pub fn cache_byte_offset(&self) -> u64 {
        sectors_to_bytes(self.cache_offset)
    }

    /// Restrict the record to `[start, end)`, moving the cache pointer along.
    ///
    /// The checksum keeps covering the originally written run.
    pub fn clip(&self, start: u64, end: u64) -> PointerRecord {
        let start = start.max(self.key.start());
        let end = end.min(self.key.end()).max(start);
        let mut out = *self;
        out.key = ExtentKey::from_range(self.key.inode, start, end);
        if !self.is_placeholder() {
            let skipped = start - self.key.start();
            out.cache_offset = self.cache_offset + skipped;
            if let Some(c) = out.checksum.as_mut() {
                c.lead += skipped;
            }
        }
        out
    }

    /// Was `self` cut from `origin` (same data at the same place), as opposed
    /// to written by someone else since?
    pub fn derives_from(&self, origin: &PointerRecord) -> bool {
        if self.dev != origin.dev
            || self.bucket != origin.bucket
            || self.dirty != origin.dirty
            || !origin.key.contains(&self.key)
        {
            return false;
        }
        if self.is_placeholder() {
            return self.cache_offset == origin.cache_offset;
        }
        // `contains` above makes the offset difference non-negative
        origin.cache_offset + (self.key.start() - origin.key.start()) == self.cache_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64, len: u64, cache_offset: u64) -> PointerRecord {
        PointerRecord::new(
            ExtentKey::new(1, offset, len),
            cache_offset,
            BucketRef { index: 0, gen: 3 },
            false,
        )
    }

    #[test]
    fn test_clip_moves_cache_pointer() {
        let r = record(8, 16, 100).with_checksum(0xdead);

        let front = r.clip(0, 12);
        assert_eq!(front.key, ExtentKey::new(1, 8, 4));
        assert_eq!(front.cache_offset, 100);
        assert_eq!(front.checksum.map(|c| (c.lead, c.len)), Some((0, 16)));

        let back = r.clip(20, 40);
        assert_eq!(back.key, ExtentKey::new(1, 20, 4));
        assert_eq!(back.cache_offset, 112);
        assert_eq!(back.checksum.map(|c| (c.lead, c.len)), Some((12, 16)));

        // Clipping a clipped record still points at the original run
        let inner = r.clip(10, 22).clip(14, 18);
        assert_eq!(inner.cache_offset, 106);
        assert_eq!(inner.checksum.map(|c| (c.lead, c.len)), Some((6, 16)));

        let whole = r.clip(0, 100);
        assert_eq!(whole, r);
    }

    #[test]
    fn test_clipped_record_derives_from_origin() {
        let r = record(8, 16, 100);
        assert!(r.clip(12, 16).derives_from(&r));
        assert!(r.derives_from(&r));

        let moved = record(12, 4, 200);
        assert!(!moved.derives_from(&r));

        let mut regen = r.clip(12, 16);
        regen.bucket.gen = 4;
        assert!(!regen.derives_from(&r));
    }

    #[test]
    fn test_derives_from_with_logical_offset_past_cache_offset() {
        // Logical sectors far beyond the cache device's size
        let r = record(1 << 20, 16, 40);
        assert!(r.derives_from(&r));
        assert!(r.clip((1 << 20) + 4, (1 << 20) + 8).derives_from(&r));

        let elsewhere = record((1 << 20) + 4, 4, 8);
        assert!(!elsewhere.derives_from(&r));
    }

    #[test]
    fn test_placeholders_match_by_token() {
        let key = ExtentKey::new(1, 0, 8);
        let a = PointerRecord::placeholder(key, 42);
        let b = PointerRecord::placeholder(key, 43);
        assert!(a.is_placeholder());
        assert!(a.clip(2, 6).derives_from(&a));
        assert!(!b.derives_from(&a));
    }
}
