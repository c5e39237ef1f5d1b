//! Data-Insertion Engine
//!
//! Puts a buffer's worth of data into the cache and commits pointer records
//! for it.
//!
//! ## Ordering
//! 1. Allocate (possibly several under-sized grants)
//! 2. A bucket opened at a new generation is logged as reused before
//!    anything is written into it; dirty data marks the bucket dirty
//!    *before* the data write is issued
//! 3. Write the chunks to the cache device concurrently
//! 4. Journal the batch and wait for it (skipped for read-miss fills)
//! 5. Commit to the index
//!
//! A fatal error mid-loop keeps whatever was already written and committed;
//! only the unattempted tail is abandoned.

use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;

use crate::alloc::{AllocPriority, AllocRequest, Allocator, Grant};
use crate::congestion::CongestionEstimator;
use crate::device::BlockDevice;
use crate::error::{CacheError, Result};
use crate::extent::{sectors_to_bytes, ExtentKey, PointerRecord};
use crate::index::KeyIndex;
use crate::journal::{Journal, JournalOp};

/// What to insert
#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub extent: ExtentKey,

    /// Exactly `extent.byte_len()` bytes
    pub data: Bytes,

    pub dirty: bool,

    /// Only commit where the index still holds (pieces of) this record.
    /// Read-miss fills pass their placeholder here.
    pub replace: Option<PointerRecord>,

    pub write_point: u32,
    pub priority: AllocPriority,
}

impl InsertRequest {
    pub fn new(extent: ExtentKey, data: Bytes, dirty: bool) -> Self {
        Self {
            extent,
            data,
            dirty,
            replace: None,
            write_point: 0,
            priority: AllocPriority::Normal,
        }
    }

    pub fn replacing(mut self, record: PointerRecord) -> Self {
        self.replace = Some(record);
        self
    }

    pub fn write_point(mut self, write_point: u32) -> Self {
        self.write_point = write_point;
        self
    }

    pub fn priority(mut self, priority: AllocPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// What an insert achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Keys committed to the index
    pub inserted: Vec<ExtentKey>,

    /// Part of the range changed concurrently and was not overwritten
    pub collided: bool,

    /// The whole range was written and committed
    pub complete: bool,
}

/// Borrowed view of the collaborators an insert needs
pub struct Inserter<'a> {
    cache: &'a dyn BlockDevice,
    index: &'a dyn KeyIndex,
    allocator: &'a dyn Allocator,
    journal: &'a dyn Journal,
    congestion: &'a CongestionEstimator,
    checksums: bool,
    max_batch: usize,
}

impl<'a> Inserter<'a> {
    pub fn new(
        cache: &'a dyn BlockDevice,
        index: &'a dyn KeyIndex,
        allocator: &'a dyn Allocator,
        journal: &'a dyn Journal,
        congestion: &'a CongestionEstimator,
    ) -> Self {
        Self {
            cache,
            index,
            allocator,
            journal,
            congestion,
            checksums: false,
            max_batch: 256,
        }
    }

    pub fn checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    pub fn max_batch(mut self, records: usize) -> Self {
        self.max_batch = records.max(1);
        self
    }

    /// Write `request.data` into the cache and commit records for it.
    ///
    /// Allocation exhaustion or a cache write error is an error for dirty
    /// data (after committing the prefix that did make it) and a silent early
    /// stop for clean data.
    pub async fn insert(&self, request: InsertRequest) -> Result<InsertOutcome> {
        let extent = request.extent;
        if request.data.len() as u64 != extent.byte_len() {
            return Err(CacheError::InvalidRequest(format!(
                "insert of {} carries {} bytes, expected {}",
                extent,
                request.data.len(),
                extent.byte_len()
            )));
        }
        if request.dirty && request.replace.is_some() {
            return Err(CacheError::InvalidRequest(
                "dirty inserts cannot be conditional".to_string(),
            ));
        }

        let mut outcome = InsertOutcome::default();
        if extent.is_empty() {
            outcome.complete = true;
            return Ok(outcome);
        }

        // Allocate and issue writes
        let mut fatal: Option<CacheError> = None;
        let mut writes = Vec::new();
        let mut cursor = extent.start();

        while cursor < extent.end() {
            let grant = match self.allocator.allocate(AllocRequest {
                max_sectors: extent.end() - cursor,
                write_point: request.write_point,
                priority: request.priority,
                for_dirty: request.dirty,
            }) {
                Ok(grant) => grant,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            assert!(
                grant.sectors > 0 && grant.sectors <= extent.end() - cursor,
                "allocator granted {} sectors for {} remaining",
                grant.sectors,
                extent.end() - cursor
            );

            if let Err(e) = self.prepare(&grant, request.dirty).await {
                self.allocator.release(grant.bucket);
                fatal = Some(e);
                break;
            }

            let key = ExtentKey::new(extent.inode, cursor, grant.sectors);
            let from = sectors_to_bytes(cursor - extent.start()) as usize;
            let chunk = request
                .data
                .slice(from..from + sectors_to_bytes(grant.sectors) as usize);

            let mut record = PointerRecord::new(key, grant.offset, grant.bucket, request.dirty);
            if self.checksums {
                record = record.with_checksum(crc32fast::hash(&chunk));
            }

            writes.push(self.write_chunk(record, chunk));
            cursor += grant.sectors;
        }

        let mut batch = Vec::with_capacity(writes.len());
        let mut failed = Vec::new();
        let mut pinned = Vec::with_capacity(writes.len());
        for (record, result) in join_all(writes).await {
            pinned.push(record.bucket);
            match result {
                Ok(()) => batch.push(record),
                Err(e) => {
                    tracing::warn!(extent = %record.key, "cache write failed: {}", e);
                    if request.dirty {
                        self.allocator.clear_dirty(record.bucket, record.key.len);
                        fatal.get_or_insert(e);
                    }
                    failed.push(record.key);
                }
            }
        }

        // Buckets stay pinned until their records are logged, so a bucket is
        // never reopened ahead of records from its previous generation
        let abandoned = (cursor < extent.end())
            .then(|| ExtentKey::from_range(extent.inode, cursor, extent.end()));
        let settled = self
            .settle(&request, &batch, &failed, abandoned, fatal, &mut outcome)
            .await;
        for bucket in pinned {
            self.allocator.release(bucket);
        }
        settled?;

        outcome.complete = failed.is_empty() && abandoned.is_none();
        Ok(outcome)
    }

    /// Log a bucket's reuse before its first write, and mark dirty data
    /// before it is written
    async fn prepare(&self, grant: &Grant, dirty: bool) -> Result<()> {
        if grant.announce {
            self.journal
                .append(JournalOp::Reuse {
                    bucket: grant.bucket,
                })
                .await?;
            self.allocator.announced(grant.bucket);
        }
        if dirty {
            self.allocator.mark_dirty(grant.bucket, grant.sectors)?;
        }
        Ok(())
    }

    /// Commit what was written, then deal with what was not
    async fn settle(
        &self,
        request: &InsertRequest,
        batch: &[PointerRecord],
        failed: &[ExtentKey],
        abandoned: Option<ExtentKey>,
        fatal: Option<CacheError>,
        outcome: &mut InsertOutcome,
    ) -> Result<()> {
        // Journal, then index
        let committed = self.commit(batch, request.replace.as_ref(), outcome).await;
        if let Err(e) = committed {
            if request.dirty {
                for record in batch {
                    if !outcome.inserted.contains(&record.key) {
                        self.allocator.clear_dirty(record.bucket, record.key.len);
                    }
                }
            }
            return Err(e);
        }

        if let Some(e) = fatal {
            tracing::warn!(
                extent = %request.extent,
                dirty = request.dirty,
                committed = outcome.inserted.len(),
                "insert stopped early: {}",
                e
            );
            if request.dirty {
                return Err(e);
            }
        }

        // Clean data that did not make it must not leave older cached data
        // visible underneath
        if request.replace.is_none() && !request.dirty {
            for key in failed.iter().chain(abandoned.iter()) {
                self.invalidate(key).await?;
            }
        }
        Ok(())
    }

    /// Drop cached data for `extent` (journaled first)
    pub async fn invalidate(&self, extent: &ExtentKey) -> Result<()> {
        if extent.is_empty() {
            return Ok(());
        }
        self.journal
            .append(JournalOp::Invalidate { extent: *extent })
            .await?;
        let removed = self.index.invalidate(extent).await?;
        self.release_displaced(&removed);
        Ok(())
    }

    async fn write_chunk(
        &self,
        record: PointerRecord,
        chunk: Bytes,
    ) -> (PointerRecord, Result<()>) {
        let started = Instant::now();
        let result = self
            .cache
            .write_at(record.cache_byte_offset(), chunk)
            .await
            .map_err(|e| CacheError::CacheDevice(e.to_string()));
        self.congestion.sample(started.elapsed());
        (record, result)
    }

    async fn commit(
        &self,
        batch: &[PointerRecord],
        replace: Option<&PointerRecord>,
        outcome: &mut InsertOutcome,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        match replace {
            None => {
                for chunk in batch.chunks(self.max_batch) {
                    self.journal.append_batch(chunk).await?;
                    let update = self.index.insert(chunk, None).await?;
                    self.release_displaced(&update.displaced);
                    outcome.collided |= update.collided;
                    outcome.inserted.extend(chunk.iter().map(|r| r.key));
                }
            }
            Some(origin) => {
                // One record at a time so a collision pins down exactly what
                // was skipped
                for record in batch {
                    let update = self
                        .index
                        .insert(std::slice::from_ref(record), Some(origin))
                        .await?;
                    self.release_displaced(&update.displaced);
                    if update.collided {
                        outcome.collided = true;
                    } else {
                        outcome.inserted.push(record.key);
                    }
                }
            }
        }
        Ok(())
    }

    fn release_displaced(&self, displaced: &[PointerRecord]) {
        for record in displaced.iter().filter(|r| r.dirty && !r.is_placeholder()) {
            self.allocator.clear_dirty(record.bucket, record.key.len);
        }
    }
}
