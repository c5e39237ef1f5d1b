//! Cache Lookup Pipeline
//!
//! Walks the index over a read's range and splits it into segments that can
//! be served from the cache device and gaps that must come from the backing
//! device.
//!
//! ```text
//!  request        [0 ─────────────────────────────── 32)
//!  index               [4 ── 8)     [12 ────── 20)~stale
//!  segments       Gap[0,4) Cache[4,8) Gap[8,32)
//! ```
//!
//! Placeholders and stale records (bucket generation moved on) read as gaps;
//! adjacent gaps are merged so each turns into one backing read.

use crate::alloc::Allocator;
use crate::error::Result;
use crate::extent::{ExtentKey, PointerRecord};
use crate::index::KeyIndex;

/// Where a segment's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSource {
    /// Read from the cache device via this (clipped) record
    Cache(PointerRecord),

    /// Read from the backing device
    Backing,
}

/// One piece of a looked-up range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub extent: ExtentKey,
    pub source: SegmentSource,
}

impl Segment {
    pub fn is_gap(&self) -> bool {
        matches!(self.source, SegmentSource::Backing)
    }
}

/// Result of a lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    /// Segments covering the request exactly, in ascending order
    pub segments: Vec<Segment>,

    /// Sectors skipped because their record was stale
    pub stale_sectors: u64,

    /// The stale records themselves, unclipped
    pub stale: Vec<PointerRecord>,
}

impl LookupResult {
    pub fn gaps(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_gap())
    }

    pub fn hit_sectors(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| !s.is_gap())
            .map(|s| s.extent.len)
            .sum()
    }

    pub fn miss_sectors(&self) -> u64 {
        self.gaps().map(|s| s.extent.len).sum()
    }
}

/// Lookup over an index, checked against the allocator's generations
pub struct CacheLookup<'a> {
    index: &'a dyn KeyIndex,
    allocator: &'a dyn Allocator,
}

impl<'a> CacheLookup<'a> {
    pub fn new(index: &'a dyn KeyIndex, allocator: &'a dyn Allocator) -> Self {
        Self { index, allocator }
    }

    pub async fn lookup(&self, extent: &ExtentKey) -> Result<LookupResult> {
        let mut result = LookupResult::default();
        if extent.is_empty() {
            return Ok(result);
        }

        let records = self.index.query_overlap(extent).await?;
        let mut cursor = extent.start();

        for record in records {
            let clipped = record.clip(extent.start(), extent.end());
            if clipped.key.is_empty() {
                continue;
            }

            if clipped.key.start() > cursor {
                push_gap(&mut result.segments, extent.inode, cursor, clipped.key.start());
            }

            if record.is_placeholder() {
                push_gap(
                    &mut result.segments,
                    extent.inode,
                    clipped.key.start(),
                    clipped.key.end(),
                );
            } else if self.allocator.is_stale(&record) {
                tracing::debug!(
                    extent = %clipped.key,
                    bucket = record.bucket.index,
                    gen = record.bucket.gen,
                    "stale pointer, re-resolving from backing device"
                );
                result.stale_sectors += clipped.key.len;
                result.stale.push(record);
                push_gap(
                    &mut result.segments,
                    extent.inode,
                    clipped.key.start(),
                    clipped.key.end(),
                );
            } else {
                result.segments.push(Segment {
                    extent: clipped.key,
                    source: SegmentSource::Cache(clipped),
                });
            }
            cursor = clipped.key.end();
        }

        if cursor < extent.end() {
            push_gap(&mut result.segments, extent.inode, cursor, extent.end());
        }

        tracing::trace!(
            extent = %extent,
            segments = result.segments.len(),
            hits = result.hit_sectors(),
            "lookup complete"
        );
        Ok(result)
    }
}

/// Append a gap, extending the previous segment if it is an adjacent gap
fn push_gap(segments: &mut Vec<Segment>, inode: u64, start: u64, end: u64) {
    if let Some(last) = segments.last_mut() {
        if last.is_gap() && last.extent.end() == start {
            last.extent = ExtentKey::from_range(inode, last.extent.start(), end);
            return;
        }
    }
    segments.push(Segment {
        extent: ExtentKey::from_range(inode, start, end),
        source: SegmentSource::Backing,
    });
}
