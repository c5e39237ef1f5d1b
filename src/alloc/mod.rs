//! Cache Allocator Module
//!
//! Grants writable ranges of the cache device.
//!
//! ## Responsibilities
//! - Hand out sector ranges from open buckets, one per write point
//! - Stamp every grant with the bucket's generation so reuse is detectable
//! - Track which buckets hold dirty data; those are never reused
//! - Keep a reserve that only dirty (write-back) allocations may consume

mod bucket;

use crate::error::Result;
use crate::extent::{BucketRef, PointerRecord};

pub use bucket::{AllocatorStats, BucketAllocator};

/// Who is asking for space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPriority {
    /// Foreground writes
    Normal,

    /// Read-miss fills; the first to be refused when space runs low
    Background,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    pub max_sectors: u64,
    pub write_point: u32,
    pub priority: AllocPriority,
    pub for_dirty: bool,
}

/// A granted cache-device range. May be shorter than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub bucket: BucketRef,

    /// First granted sector on the cache device
    pub offset: u64,

    pub sectors: u64,

    /// The bucket's current generation has not been logged yet. Whoever
    /// holds this grant must log the reuse, then call `announced`, before
    /// writing into it.
    pub announce: bool,
}

/// Cache-space allocator. Internally thread-safe.
///
/// Every grant pins its bucket until `release`; pinned buckets are never
/// reused.
pub trait Allocator: Send + Sync {
    /// Grant up to `max_sectors`. Fails with `AllocExhausted`.
    fn allocate(&self, request: AllocRequest) -> Result<Grant>;

    /// Record that `sectors` of dirty data are about to land in `bucket`
    fn mark_dirty(&self, bucket: BucketRef, sectors: u64) -> Result<()>;

    /// `sectors` of dirty data in `bucket` are clean or gone
    fn clear_dirty(&self, bucket: BucketRef, sectors: u64);

    /// Drop the pin taken by `allocate`
    fn release(&self, bucket: BucketRef);

    /// The reuse of `bucket` at its generation is durably logged
    fn announced(&self, bucket: BucketRef);

    /// Current generation of bucket `index`
    fn current_gen(&self, index: u32) -> Option<u8>;

    /// Percentage of buckets that cannot be reclaimed right now
    fn in_use_percent(&self) -> u8;

    /// Re-register a recovered record's bucket. Records whose generation no
    /// longer matches the bucket's are left unclaimed (and so read as stale).
    fn claim(&self, record: &PointerRecord);

    /// Does `record` point into a bucket that has since been reused?
    fn is_stale(&self, record: &PointerRecord) -> bool {
        self.current_gen(record.bucket.index) != Some(record.bucket.gen)
    }
}
