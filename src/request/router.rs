//! Request router
//!
//! Per request: decide bypass vs. cache, drive lookup and insertion, and
//! acknowledge the originator exactly once.
//!
//! Read-miss fills run after the acknowledgement. The admission permit is
//! held until they finish, so a detach drains them too.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;

use crate::alloc::AllocPriority;
use crate::config::CacheMode;
use crate::device::read_record;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::extent::{ExtentKey, PointerRecord};
use crate::insert::InsertRequest;
use crate::lookup::{Segment, SegmentSource};
use crate::sequential::Classification;

use super::{BypassReason, Completion, IoFlags, IoOp, IoRequest, IoResult};

/// Write point for foreground writes
const FOREGROUND_WRITE_POINT: u32 = 0;

/// Write point for read-miss fills
const FILL_WRITE_POINT: u32 = 1;

/// Backing data read for a gap, to be inserted once the read is acknowledged
struct PendingFill {
    placeholder: PointerRecord,
    data: Bytes,
}

impl CacheEngine {
    /// Run `request` to completion and acknowledge it through `completion`
    pub async fn handle_request(&self, request: IoRequest, completion: Completion) {
        let _permit = self.admission.admit().await;

        let mut fills = Vec::new();
        let result = self.route(request, &mut fills).await;
        completion.complete(result);

        self.populate(fills).await;
    }

    /// `handle_request`, awaiting the acknowledgement
    pub async fn execute(&self, request: IoRequest) -> IoResult {
        let (completion, ack) = Completion::channel();
        self.handle_request(request, completion).await;
        ack.await
            .map_err(|_| CacheError::Task("request dropped without acknowledgement".to_string()))?
    }

    /// Why `request` should skip the cache, if it should.
    ///
    /// Updates the caller's sequential history as a side effect.
    pub fn should_bypass(&self, request: &IoRequest, extent: &ExtentKey) -> Option<BypassReason> {
        let is_write = matches!(request.op, IoOp::Write { .. } | IoOp::Discard { .. });

        if matches!(request.op, IoOp::Discard { .. }) {
            return Some(BypassReason::Discard);
        }
        if self.is_detaching() {
            return Some(BypassReason::Detaching);
        }
        match self.config.cache_mode {
            CacheMode::None => return Some(BypassReason::Disabled),
            CacheMode::WriteAround if is_write => return Some(BypassReason::WriteAround),
            _ => {}
        }
        if self.allocator.in_use_percent() >= self.config.cache_full_cutoff_percent {
            return Some(BypassReason::CacheFull);
        }
        if !extent.is_aligned(self.config.block_sectors()) {
            return Some(BypassReason::Unaligned);
        }
        if request.flags.meta {
            return None;
        }

        let congestion = self.congestion.is_congested();
        let decision = self.sequential.classify(request.caller, extent, congestion);
        match decision.classification {
            Classification::Cache => None,
            Classification::BypassSequential => Some(BypassReason::Sequential),
            Classification::BypassCongested => Some(BypassReason::Congested),
        }
    }

    async fn route(&self, request: IoRequest, fills: &mut Vec<PendingFill>) -> IoResult {
        if let IoOp::Flush = request.op {
            self.flush_barrier(request.flags).await?;
            return Ok(None);
        }

        let extent = request.extent()?;
        if extent.is_empty() {
            return match request.op {
                IoOp::Read { .. } => Ok(Some(Bytes::new())),
                _ => Ok(None),
            };
        }

        let bypass = self.should_bypass(&request, &extent);
        if let Some(reason) = bypass {
            match reason {
                BypassReason::Sequential => self.stats.bypass_sequential(1),
                BypassReason::Congested => self.stats.bypass_congested(1),
                _ => self.stats.bypass_other(1),
            }
        }
        tracing::debug!(
            caller = request.caller,
            extent = %extent,
            bypass = ?bypass,
            "routing request"
        );

        match request.op {
            IoOp::Read { .. } => {
                let data = self.read(&extent, bypass.is_none(), fills).await?;
                Ok(Some(data))
            }
            IoOp::Write { data } => {
                self.write(&extent, data, request.flags, bypass).await?;
                Ok(None)
            }
            IoOp::Discard { .. } => {
                self.discard(&extent).await?;
                Ok(None)
            }
            IoOp::Flush => Ok(None),
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    async fn flush_barrier(&self, flags: IoFlags) -> Result<()> {
        self.backing.flush().await.map_err(backing_error)?;
        if flags.preflush || flags.fua {
            self.journal.flush().await?;
            self.cache.flush().await.map_err(cache_error)?;
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Bypassed reads still go through the index so dirty data is never
    /// skipped; they just never populate the cache.
    async fn read(
        &self,
        extent: &ExtentKey,
        populate: bool,
        fills: &mut Vec<PendingFill>,
    ) -> Result<Bytes> {
        let lookup = self.lookup().lookup(extent).await?;
        self.stats.cache_hit_sectors(lookup.hit_sectors());
        self.stats.cache_miss_sectors(lookup.miss_sectors());
        self.stats.stale_pointers(lookup.stale_sectors);
        if populate {
            for record in &lookup.stale {
                self.evict_stale(record).await;
            }
        }

        let parts = join_all(
            lookup
                .segments
                .iter()
                .map(|segment| self.read_segment(segment, populate)),
        )
        .await;

        let mut buf = BytesMut::with_capacity(extent.byte_len() as usize);
        for part in parts {
            let (data, fill) = part?;
            buf.extend_from_slice(&data);
            fills.extend(fill);
        }
        Ok(buf.freeze())
    }

    async fn read_segment(
        &self,
        segment: &Segment,
        populate: bool,
    ) -> Result<(Bytes, Option<PendingFill>)> {
        match segment.source {
            SegmentSource::Cache(record) => match self.read_cached(&record).await {
                Ok(data) => Ok((data, None)),
                Err(e) if !record.dirty && e.is_recoverable_read() => {
                    tracing::debug!(
                        extent = %record.key,
                        "cache read failed, retrying from backing device: {}",
                        e
                    );
                    self.stats.read_retries(1);
                    Ok((self.read_backing(&segment.extent).await?, None))
                }
                Err(e) => Err(e),
            },
            SegmentSource::Backing => self.read_gap(&segment.extent, populate).await,
        }
    }

    async fn read_cached(&self, record: &PointerRecord) -> Result<Bytes> {
        let started = Instant::now();
        let data = read_record(self.cache.as_ref(), record).await;
        self.congestion.sample(started.elapsed());

        // The bucket may have been reused while the read was in flight
        if self.allocator.is_stale(record) {
            self.stats.stale_pointers(record.key.len);
            return Err(CacheError::StaleBucket {
                bucket: record.bucket.index,
                gen: record.bucket.gen,
            });
        }
        data.map_err(cache_error)
    }

    async fn read_gap(
        &self,
        extent: &ExtentKey,
        populate: bool,
    ) -> Result<(Bytes, Option<PendingFill>)> {
        if !populate {
            return Ok((self.read_backing(extent).await?, None));
        }

        let placeholder = PointerRecord::placeholder(*extent, self.next_token());
        let reserved = match self.index.reserve(&placeholder).await {
            Ok(reserved) => reserved,
            Err(e) => {
                tracing::warn!(extent = %extent, "placeholder reservation failed: {}", e);
                false
            }
        };

        let data = self.read_backing(extent).await?;
        let fill = reserved.then(|| PendingFill {
            placeholder,
            data: data.clone(),
        });
        Ok((data, fill))
    }

    /// Swap a stale record for a placeholder so its range can be refilled.
    /// A no-op if the record changed in the meantime.
    async fn evict_stale(&self, record: &PointerRecord) {
        let placeholder = PointerRecord::placeholder(record.key, self.next_token());
        if let Err(e) = self.index.insert(&[placeholder], Some(record)).await {
            tracing::warn!(extent = %record.key, "stale record eviction failed: {}", e);
        }
    }

    /// Insert read-miss data. Failures only cost a future cache hit.
    async fn populate(&self, fills: Vec<PendingFill>) {
        if fills.is_empty() {
            return;
        }
        let inserter = self.inserter();
        let inserts = fills.into_iter().map(|fill| {
            let request = InsertRequest::new(fill.placeholder.key, fill.data, false)
                .replacing(fill.placeholder)
                .write_point(FILL_WRITE_POINT)
                .priority(AllocPriority::Background);
            inserter.insert(request)
        });

        for result in join_all(inserts).await {
            match result {
                Ok(outcome) => {
                    if outcome.collided {
                        self.stats.collisions(1);
                    }
                    if !outcome.complete {
                        self.stats.insert_failures(1);
                    }
                }
                Err(e) => {
                    self.stats.insert_failures(1);
                    tracing::warn!("read-miss fill failed: {}", e);
                }
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn write(
        &self,
        extent: &ExtentKey,
        data: Bytes,
        flags: IoFlags,
        bypass: Option<BypassReason>,
    ) -> Result<()> {
        if flags.preflush {
            self.backing.flush().await.map_err(backing_error)?;
        }

        // Overlapping dirty data must stay ordered behind this write, so the
        // write becomes dirty too, whatever the mode says
        let dirty_overlap = self.overlaps_dirty(extent).await?;
        let write_back =
            dirty_overlap || (bypass.is_none() && self.config.cache_mode == CacheMode::WriteBack);
        if dirty_overlap && (bypass.is_some() || self.config.cache_mode != CacheMode::WriteBack) {
            self.stats.forced_writeback(1);
            tracing::debug!(
                extent = %extent,
                mode = %self.config.cache_mode,
                "forcing write-back over dirty data"
            );
        }

        if write_back {
            let request =
                InsertRequest::new(*extent, data, true).write_point(FOREGROUND_WRITE_POINT);
            self.inserter().insert(request).await?;
            if flags.fua {
                self.journal.flush().await?;
                self.cache.flush().await.map_err(cache_error)?;
            }
            return Ok(());
        }

        match bypass {
            None => self.write_through(extent, data).await?,
            Some(_) => {
                self.write_backing(extent, data).await?;
                self.inserter().invalidate(extent).await?;
            }
        }

        if flags.fua {
            self.backing.flush().await.map_err(backing_error)?;
        }
        Ok(())
    }

    async fn write_through(&self, extent: &ExtentKey, data: Bytes) -> Result<()> {
        let inserter = self.inserter();
        let request =
            InsertRequest::new(*extent, data.clone(), false).write_point(FOREGROUND_WRITE_POINT);
        let (backing, cached) =
            tokio::join!(self.write_backing(extent, data), inserter.insert(request));

        if let Err(e) = backing {
            // The cache must not hold data the backing device never got
            inserter.invalidate(extent).await?;
            return Err(e);
        }

        match cached {
            Ok(outcome) if outcome.complete => {}
            Ok(_) => self.stats.insert_failures(1),
            Err(e) => {
                self.stats.insert_failures(1);
                tracing::warn!(extent = %extent, "write-through insert failed: {}", e);
                inserter.invalidate(extent).await?;
            }
        }
        Ok(())
    }

    async fn discard(&self, extent: &ExtentKey) -> Result<()> {
        self.inserter().invalidate(extent).await?;
        self.backing
            .discard(extent.byte_offset(), extent.byte_len())
            .await
            .map_err(backing_error)
    }

    async fn overlaps_dirty(&self, extent: &ExtentKey) -> Result<bool> {
        Ok(self
            .index
            .query_overlap(extent)
            .await?
            .iter()
            .any(|r| r.dirty && !r.is_placeholder()))
    }

    // =========================================================================
    // Backing Device
    // =========================================================================

    async fn read_backing(&self, extent: &ExtentKey) -> Result<Bytes> {
        self.backing
            .read_at(extent.byte_offset(), extent.byte_len())
            .await
            .map_err(backing_error)
    }

    async fn write_backing(&self, extent: &ExtentKey, data: Bytes) -> Result<()> {
        self.backing
            .write_at(extent.byte_offset(), data)
            .await
            .map_err(backing_error)
    }
}

fn backing_error(e: CacheError) -> CacheError {
    match e {
        CacheError::BackingDevice(_) => e,
        other => CacheError::BackingDevice(other.to_string()),
    }
}

fn cache_error(e: CacheError) -> CacheError {
    match e {
        CacheError::CacheDevice(_) | CacheError::ChecksumMismatch { .. } => e,
        other => CacheError::CacheDevice(other.to_string()),
    }
}
