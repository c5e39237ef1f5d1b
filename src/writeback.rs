//! Writeback
//!
//! Copies dirty cache data to the backing device and downgrades the records
//! to clean.
//!
//! ```text
//!  scan_dirty ─► read cache ─► write backing ─► insert clean copy
//!                                               (replace_if_unchanged = dirty record)
//! ```
//!
//! A collision on the final insert means a newer write replaced (part of)
//! the record while it was being flushed. The newer data is left alone; its
//! own record supersedes this one.
//!
//! Clean copies are not journaled. After a crash the replayed log still holds
//! the dirty record, which is flushed again.

use futures::future::join_all;

use crate::alloc::Allocator;
use crate::device::{read_record, BlockDevice};
use crate::error::{CacheError, Result};
use crate::extent::{ExtentKey, PointerRecord};
use crate::index::KeyIndex;
use crate::stats::CacheStats;

/// Totals for one or more writeback passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritebackReport {
    pub scanned: usize,
    pub flushed_records: usize,
    pub flushed_sectors: u64,

    /// Superseded by a newer write during the flush
    pub collided: usize,

    /// Left dirty after an I/O error
    pub failed: usize,
}

impl WritebackReport {
    pub(crate) fn merge(&mut self, other: WritebackReport) {
        self.scanned += other.scanned;
        self.flushed_records += other.flushed_records;
        self.flushed_sectors += other.flushed_sectors;
        self.collided += other.collided;
        self.failed += other.failed;
    }
}

enum Flushed {
    Clean(u64),
    Collided,
}

pub struct Writeback<'a> {
    backing: &'a dyn BlockDevice,
    cache: &'a dyn BlockDevice,
    index: &'a dyn KeyIndex,
    allocator: &'a dyn Allocator,
    stats: &'a CacheStats,
}

impl<'a> Writeback<'a> {
    pub fn new(
        backing: &'a dyn BlockDevice,
        cache: &'a dyn BlockDevice,
        index: &'a dyn KeyIndex,
        allocator: &'a dyn Allocator,
        stats: &'a CacheStats,
    ) -> Self {
        Self {
            backing,
            cache,
            index,
            allocator,
            stats,
        }
    }

    /// Flush up to `limit` dirty records from the start of the index
    pub async fn flush_once(&self, limit: usize) -> Result<WritebackReport> {
        self.flush_from(None, limit).await.map(|(report, _)| report)
    }

    /// Flush every record that is dirty when the pass reaches it.
    ///
    /// Records that fail stay dirty and are reported, not retried.
    pub async fn flush_all(&self, batch: usize) -> Result<WritebackReport> {
        let mut total = WritebackReport::default();
        let mut cursor = None;
        loop {
            let (report, last) = self.flush_from(cursor, batch).await?;
            if report.scanned == 0 {
                break;
            }
            total.merge(report);
            cursor = last;
        }

        if total.scanned > 0 {
            tracing::info!(
                records = total.flushed_records,
                sectors = total.flushed_sectors,
                collided = total.collided,
                failed = total.failed,
                "writeback pass complete"
            );
        }
        Ok(total)
    }

    async fn flush_from(
        &self,
        after: Option<ExtentKey>,
        limit: usize,
    ) -> Result<(WritebackReport, Option<ExtentKey>)> {
        let records = self.index.scan_dirty(after, limit.max(1)).await?;
        let mut report = WritebackReport {
            scanned: records.len(),
            ..Default::default()
        };
        let last = records.last().map(|r| r.key);

        let results = join_all(records.iter().map(|record| self.flush_record(record))).await;
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(Flushed::Clean(sectors)) => {
                    report.flushed_records += 1;
                    report.flushed_sectors += sectors;
                }
                Ok(Flushed::Collided) => report.collided += 1,
                Err(e) => {
                    tracing::warn!(extent = %record.key, "writeback failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        self.stats.writeback_sectors(report.flushed_sectors);
        self.stats.collisions(report.collided as u64);
        Ok((report, last))
    }

    async fn flush_record(&self, record: &PointerRecord) -> Result<Flushed> {
        let data = read_record(self.cache, record).await.map_err(|e| match e {
            CacheError::ChecksumMismatch { .. } => e,
            other => CacheError::CacheDevice(other.to_string()),
        })?;

        self.backing
            .write_at(record.key.byte_offset(), data)
            .await
            .map_err(|e| CacheError::BackingDevice(e.to_string()))?;

        let clean = PointerRecord {
            dirty: false,
            ..*record
        };
        let update = self.index.insert(&[clean], Some(record)).await?;
        for displaced in update.displaced.iter().filter(|r| r.dirty) {
            self.allocator.clear_dirty(displaced.bucket, displaced.key.len);
        }

        if update.collided {
            Ok(Flushed::Collided)
        } else {
            Ok(Flushed::Clean(record.key.len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocPriority, AllocRequest, BucketAllocator};
    use crate::device::MemoryDevice;
    use crate::index::ExtentTree;
    use bytes::Bytes;

    struct Fixture {
        backing: MemoryDevice,
        cache: MemoryDevice,
        index: ExtentTree,
        alloc: BucketAllocator,
        stats: CacheStats,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backing: MemoryDevice::new(1 << 20),
                cache: MemoryDevice::new(1 << 20),
                index: ExtentTree::new(),
                alloc: BucketAllocator::new(16, 128, 0),
                stats: CacheStats::new(),
            }
        }

        fn writeback(&self) -> Writeback<'_> {
            Writeback::new(&self.backing, &self.cache, &self.index, &self.alloc, &self.stats)
        }

        /// Place `fill`-patterned dirty data for `key` in the cache
        async fn dirty(&self, key: ExtentKey, fill: u8) -> PointerRecord {
            let grant = self
                .alloc
                .allocate(AllocRequest {
                    max_sectors: key.len,
                    write_point: 0,
                    priority: AllocPriority::Normal,
                    for_dirty: true,
                })
                .unwrap();
            assert_eq!(grant.sectors, key.len);
            self.alloc.mark_dirty(grant.bucket, grant.sectors).unwrap();
            let record = PointerRecord::new(key, grant.offset, grant.bucket, true);
            self.cache
                .write_at(
                    record.cache_byte_offset(),
                    Bytes::from(vec![fill; key.byte_len() as usize]),
                )
                .await
                .unwrap();
            self.alloc.release(grant.bucket);
            self.index.insert(&[record], None).await.unwrap();
            record
        }
    }

    #[tokio::test]
    async fn test_flush_moves_dirty_data_to_backing() {
        let fx = Fixture::new();
        fx.dirty(ExtentKey::new(1, 0, 8), 0xAB).await;

        let report = fx.writeback().flush_all(4).await.unwrap();

        assert_eq!(report.flushed_records, 1);
        assert_eq!(report.flushed_sectors, 8);
        assert_eq!(fx.backing.snapshot(0, 4096), vec![0xAB; 4096]);
        assert_eq!(fx.index.dirty_sectors(), 0);
        assert_eq!(fx.alloc.stats().dirty_buckets, 0);
        assert_eq!(fx.stats.snapshot().writeback_sectors, 8);
    }

    #[tokio::test]
    async fn test_flush_of_record_far_past_its_cache_offset() {
        let fx = Fixture::new();
        let record = fx.dirty(ExtentKey::new(1, 1024, 8), 0x5A).await;
        assert!(record.key.start() > record.cache_offset);

        let report = fx.writeback().flush_once(8).await.unwrap();

        assert_eq!(report.flushed_sectors, 8);
        assert_eq!(report.collided, 0);
        assert_eq!(fx.backing.snapshot(record.key.byte_offset(), 4096), vec![0x5A; 4096]);
        assert_eq!(fx.index.dirty_sectors(), 0);
    }

    #[tokio::test]
    async fn test_superseded_record_is_not_downgraded() {
        let fx = Fixture::new();
        let old = fx.dirty(ExtentKey::new(1, 0, 8), 0x01).await;

        // Newer dirty data replaces the record before the flush commits
        let newer = fx.dirty(ExtentKey::new(1, 0, 8), 0x02).await;
        fx.alloc.clear_dirty(old.bucket, old.key.len);

        let wb = fx.writeback();
        let outcome = wb.flush_record(&old).await.unwrap();
        assert!(matches!(outcome, Flushed::Collided));

        let records = fx.index.records();
        assert_eq!(records, vec![newer]);
        assert!(records[0].dirty);
    }

    #[tokio::test]
    async fn test_failed_read_leaves_record_dirty() {
        let fx = Fixture::new();
        fx.dirty(ExtentKey::new(1, 0, 8), 0x01).await;
        fx.cache.fail_next_reads(1);

        let report = fx.writeback().flush_once(8).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fx.index.dirty_sectors(), 8);
        assert_eq!(fx.backing.counters().writes, 0);
    }
}
