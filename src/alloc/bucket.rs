//! Bucket allocator
//!
//! Arena of fixed-size buckets addressed by `(index, generation)`.
//!
//! ```text
//!   free ──► open (per write point) ──► full ──┐
//!    ▲        gen += 1                         │ reclaim
//!    └──────────── (clean, unpinned) ◄─────────┘
//! ```
//!
//! Every open starts a new generation. Grants in a generation are flagged
//! `announce` until its reuse has been logged, so no data lands in a reused
//! bucket before the log can tell the old records are gone.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::extent::{bytes_to_sectors, BucketRef, PointerRecord};

use super::{AllocPriority, AllocRequest, Allocator, Grant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketState {
    Free,
    Open,
    Full,
}

#[derive(Debug, Clone)]
struct Bucket {
    gen: u8,

    /// The reuse at `gen` is durably logged
    announced: bool,
    fill: u64,
    dirty_sectors: u64,
    pins: u32,
    state: BucketState,
}

impl Bucket {
    fn reclaimable(&self) -> bool {
        self.state == BucketState::Full && self.dirty_sectors == 0 && self.pins == 0
    }
}

struct Inner {
    buckets: Vec<Bucket>,
    free: VecDeque<u32>,

    /// Filled buckets, oldest first
    full: VecDeque<u32>,

    /// (write point, dirty) -> open bucket
    open: HashMap<(u32, bool), u32>,
}

/// Point-in-time allocator occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub buckets: usize,
    pub free: usize,
    pub open: usize,
    pub full: usize,
    pub dirty_buckets: usize,
    pub reclaimed: u64,
}

/// Generation-stamped bucket arena
pub struct BucketAllocator {
    bucket_size: u64,
    reserve: usize,
    inner: Mutex<Inner>,
    reclaimed: AtomicU64,
}

impl BucketAllocator {
    /// `buckets` buckets of `bucket_size` sectors each
    pub fn new(buckets: usize, bucket_size: u64, reserve: usize) -> Self {
        let inner = Inner {
            buckets: vec![
                Bucket {
                    gen: 0,
                    announced: false,
                    fill: 0,
                    dirty_sectors: 0,
                    pins: 0,
                    state: BucketState::Free,
                };
                buckets
            ],
            free: (0..buckets as u32).collect(),
            full: VecDeque::new(),
            open: HashMap::new(),
        };
        Self {
            bucket_size,
            reserve,
            inner: Mutex::new(inner),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Carve a cache device of `len_bytes` into buckets
    pub fn for_device(len_bytes: u64, bucket_size: u64, reserve: usize) -> Self {
        let buckets = (bytes_to_sectors(len_bytes) / bucket_size) as usize;
        Self::new(buckets, bucket_size, reserve)
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    /// Set a free bucket's generation to the last one recovered from the
    /// log, so the next open moves past it
    pub fn restore_generation(&self, index: u32, gen: u8) {
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(index as usize) {
            if bucket.state == BucketState::Free {
                bucket.gen = gen;
            }
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock();
        AllocatorStats {
            buckets: inner.buckets.len(),
            free: inner.free.len(),
            open: inner.open.len(),
            full: inner.full.len(),
            dirty_buckets: inner.buckets.iter().filter(|b| b.dirty_sectors > 0).count(),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Force bucket `index` back to the free list, bumping its generation.
    /// Refused while the bucket is pinned or holds dirty data.
    pub fn invalidate_bucket(&self, index: u32) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(bucket) = inner.buckets.get(index as usize) else {
            return false;
        };
        if bucket.pins > 0 || bucket.dirty_sectors > 0 {
            return false;
        }

        inner.full.retain(|&i| i != index);
        inner.open.retain(|_, &mut i| i != index);
        inner.free.retain(|&i| i != index);

        let bucket = &mut inner.buckets[index as usize];
        bucket.gen = bucket.gen.wrapping_add(1);
        bucket.fill = 0;
        bucket.state = BucketState::Free;
        inner.free.push_back(index);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn obtainable(inner: &Inner) -> usize {
        inner.free.len()
            + inner
                .full
                .iter()
                .filter(|&&i| inner.buckets[i as usize].reclaimable())
                .count()
    }

    /// Pick a bucket to open: free list first, then the oldest clean full one
    fn take_bucket(&self, inner: &mut Inner, request: &AllocRequest) -> Result<u32> {
        let floor = match (request.for_dirty, request.priority) {
            (true, _) => 0,
            (false, AllocPriority::Normal) => self.reserve,
            (false, AllocPriority::Background) => self.reserve * 2,
        };
        if Self::obtainable(inner) <= floor {
            return Err(CacheError::AllocExhausted);
        }

        let index = match inner.free.pop_front() {
            Some(index) => index,
            None => {
                let pos = inner
                    .full
                    .iter()
                    .position(|&i| inner.buckets[i as usize].reclaimable())
                    .ok_or(CacheError::AllocExhausted)?;
                let index = inner.full.remove(pos).ok_or(CacheError::AllocExhausted)?;
                self.reclaimed.fetch_add(1, Ordering::Relaxed);
                index
            }
        };

        let bucket = &mut inner.buckets[index as usize];
        bucket.gen = bucket.gen.wrapping_add(1);
        bucket.announced = false;
        bucket.fill = 0;
        tracing::trace!(bucket = index, gen = bucket.gen, "opened bucket");
        Ok(index)
    }
}

impl Allocator for BucketAllocator {
    fn allocate(&self, request: AllocRequest) -> Result<Grant> {
        if request.max_sectors == 0 {
            return Err(CacheError::InvalidRequest(
                "zero-sector allocation".to_string(),
            ));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let point = (request.write_point, request.for_dirty);

        let index = match inner.open.get(&point) {
            Some(&index) => index,
            None => {
                let index = self.take_bucket(inner, &request)?;
                inner.buckets[index as usize].state = BucketState::Open;
                inner.open.insert(point, index);
                index
            }
        };

        let bucket_size = self.bucket_size;
        let bucket = &mut inner.buckets[index as usize];
        let sectors = request.max_sectors.min(bucket_size - bucket.fill);
        let offset = index as u64 * bucket_size + bucket.fill;
        bucket.fill += sectors;
        bucket.pins += 1;
        let grant = Grant {
            bucket: BucketRef {
                index,
                gen: bucket.gen,
            },
            offset,
            sectors,
            announce: !bucket.announced,
        };

        if bucket.fill == bucket_size {
            bucket.state = BucketState::Full;
            inner.open.remove(&point);
            inner.full.push_back(index);
        }

        Ok(grant)
    }

    fn mark_dirty(&self, bucket: BucketRef, sectors: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.buckets.get_mut(bucket.index as usize) {
            Some(b) if b.gen == bucket.gen => {
                b.dirty_sectors += sectors;
                Ok(())
            }
            _ => Err(CacheError::StaleBucket {
                bucket: bucket.index,
                gen: bucket.gen,
            }),
        }
    }

    fn clear_dirty(&self, bucket: BucketRef, sectors: u64) {
        let mut inner = self.inner.lock();
        if let Some(b) = inner.buckets.get_mut(bucket.index as usize) {
            if b.gen == bucket.gen {
                b.dirty_sectors = b.dirty_sectors.saturating_sub(sectors);
            }
        }
    }

    fn release(&self, bucket: BucketRef) {
        let mut inner = self.inner.lock();
        if let Some(b) = inner.buckets.get_mut(bucket.index as usize) {
            b.pins = b.pins.saturating_sub(1);
        }
    }

    fn announced(&self, bucket: BucketRef) {
        let mut inner = self.inner.lock();
        if let Some(b) = inner.buckets.get_mut(bucket.index as usize) {
            if b.gen == bucket.gen {
                b.announced = true;
            }
        }
    }

    fn current_gen(&self, index: u32) -> Option<u8> {
        self.inner.lock().buckets.get(index as usize).map(|b| b.gen)
    }

    fn in_use_percent(&self) -> u8 {
        let inner = self.inner.lock();
        if inner.buckets.is_empty() {
            return 100;
        }
        let busy = inner
            .buckets
            .iter()
            .filter(|b| b.state != BucketState::Free && !b.reclaimable())
            .count();
        (busy * 100 / inner.buckets.len()) as u8
    }

    fn claim(&self, record: &PointerRecord) {
        if record.is_placeholder() {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let index = record.bucket.index;
        let Some(bucket) = inner.buckets.get_mut(index as usize) else {
            return;
        };

        if bucket.gen != record.bucket.gen {
            tracing::debug!(
                bucket = index,
                gen = record.bucket.gen,
                current = bucket.gen,
                "not claiming record from an older generation"
            );
            return;
        }

        let first_claim = bucket.state == BucketState::Free;
        bucket.announced = true;
        bucket.state = BucketState::Full;
        bucket.fill = self.bucket_size;
        if record.dirty {
            bucket.dirty_sectors += record.key.len;
        }

        if first_claim {
            inner.free.retain(|&i| i != index);
            inner.full.push_back(index);
        }
    }
}
