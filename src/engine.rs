//! Engine Module
//!
//! The cached volume: owns every collaborator the request path needs.
//!
//! ## Responsibilities
//! - Open: validate config, recover the journal, rebuild the index and
//!   re-claim allocator buckets
//! - Serve requests (see `request::router`)
//! - Detach: stop populating the cache, drain in-flight requests, flush
//!   dirty data to the backing device

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::alloc::{Allocator, BucketAllocator};
use crate::config::Config;
use crate::congestion::CongestionEstimator;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::index::{ExtentTree, KeyIndex};
use crate::insert::Inserter;
use crate::journal::{FileJournal, Journal, JournalOp};
use crate::lookup::CacheLookup;
use crate::request::AdmissionGate;
use crate::sequential::SequentialDetector;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::writeback::{Writeback, WritebackReport};

/// A backing device fronted by a cache device
///
/// ## Concurrency Model
///
/// - No engine-wide lock. Requests run concurrently.
/// - The index and allocator are internally synchronized and are the only
///   state concurrent requests contend on.
/// - Ordering between overlapping requests comes from the index alone
///   (last committed wins; losers see `collided`).
/// - Sequential history and congestion use short critical sections or
///   plain atomics, never held across I/O.
pub struct CacheEngine {
    pub(crate) config: Config,

    pub(crate) backing: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<dyn BlockDevice>,

    pub(crate) index: Arc<dyn KeyIndex>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) journal: Arc<dyn Journal>,

    pub(crate) congestion: CongestionEstimator,
    pub(crate) sequential: SequentialDetector,
    pub(crate) stats: CacheStats,
    pub(crate) admission: AdmissionGate,

    /// Set once detach starts; everything bypasses from then on
    pub(crate) detaching: AtomicBool,

    /// Source of read-miss placeholder tokens
    next_token: AtomicU64,
}

impl CacheEngine {
    /// Open a cached volume
    ///
    /// On startup:
    /// 1. Validate the config
    /// 2. Recover the journal (a torn tail is truncated)
    /// 3. Replay it into a fresh index
    /// 4. Restore each bucket's last logged generation
    /// 5. Re-claim the buckets the surviving records point into; records
    ///    from an earlier generation of a reused bucket are dropped
    pub async fn open(
        config: Config,
        backing: Arc<dyn BlockDevice>,
        cache: Arc<dyn BlockDevice>,
    ) -> Result<Self> {
        config.validate()?;

        let path = config.journal_path.clone();
        let strategy = config.journal_sync;
        let (journal, entries, recovery) =
            tokio::task::spawn_blocking(move || FileJournal::open(&path, strategy)).await??;

        if recovery.entries_recovered > 0 || recovery.was_truncated {
            tracing::info!(
                recovered = recovery.entries_recovered,
                corrupted = recovery.entries_corrupted,
                last_lsn = recovery.last_lsn,
                truncated = recovery.was_truncated,
                "journal recovered"
            );
        }

        // Latest generation each bucket was logged at
        let mut generations: HashMap<u32, u8> = HashMap::new();
        let index = ExtentTree::new();
        for entry in entries {
            match entry.op {
                JournalOp::Insert { records } => {
                    for record in records.iter().filter(|r| !r.is_placeholder()) {
                        generations.insert(record.bucket.index, record.bucket.gen);
                    }
                    index.insert(&records, None).await?;
                }
                JournalOp::Invalidate { extent } => {
                    index.invalidate(&extent).await?;
                }
                JournalOp::Reuse { bucket } => {
                    generations.insert(bucket.index, bucket.gen);
                }
            }
        }

        let allocator = BucketAllocator::for_device(
            cache.len_bytes(),
            config.bucket_size,
            config.reserve_buckets,
        );
        for (&bucket, &gen) in &generations {
            allocator.restore_generation(bucket, gen);
        }

        let mut stale = 0usize;
        for record in index.records() {
            allocator.claim(&record);
            if !record.is_placeholder() && allocator.is_stale(&record) {
                index.invalidate(&record.key).await?;
                stale += 1;
            }
        }
        if stale > 0 {
            tracing::info!(stale, "dropped records from reused buckets");
        }

        tracing::info!(
            mode = %config.cache_mode,
            records = index.len(),
            dirty_sectors = index.dirty_sectors(),
            "cache engine opened"
        );

        Ok(Self::with_components(
            config,
            backing,
            cache,
            Arc::new(index),
            Arc::new(allocator),
            Arc::new(journal),
        ))
    }

    /// Assemble an engine from already-built collaborators. No recovery.
    pub fn with_components(
        config: Config,
        backing: Arc<dyn BlockDevice>,
        cache: Arc<dyn BlockDevice>,
        index: Arc<dyn KeyIndex>,
        allocator: Arc<dyn Allocator>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            congestion: CongestionEstimator::from_config(&config),
            sequential: SequentialDetector::from_config(&config),
            admission: AdmissionGate::new(
                config.pending_low_watermark,
                config.pending_high_watermark,
            ),
            stats: CacheStats::new(),
            detaching: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            config,
            backing,
            cache,
            index,
            allocator,
            journal,
        }
    }

    /// Stop caching, wait for in-flight requests, flush dirty data.
    ///
    /// Requests keep being served (straight from the backing device) after
    /// this returns.
    pub async fn detach(&self) -> Result<WritebackReport> {
        if !self.detaching.swap(true, Ordering::AcqRel) {
            tracing::info!(pending = self.admission.pending(), "detaching cache");
        }
        self.admission.drained().await;

        // Writes over still-dirty ranges keep landing in the cache during
        // detach, possibly behind the pass cursor
        let mut report = WritebackReport::default();
        loop {
            let pass = self.writeback().flush_all(self.config.writeback_batch).await?;
            let progressed = pass.flushed_records + pass.collided > 0;
            report.merge(pass);
            if !progressed || self.index.scan_dirty(None, 1).await?.is_empty() {
                break;
            }
        }
        self.journal.flush().await?;
        self.cache.flush().await?;
        self.backing.flush().await?;
        Ok(report)
    }

    /// One writeback pass over at most `writeback_batch` dirty records
    pub async fn writeback_once(&self) -> Result<WritebackReport> {
        self.writeback().flush_once(self.config.writeback_batch).await
    }

    // =========================================================================
    // Collaborator Views
    // =========================================================================

    pub(crate) fn lookup(&self) -> CacheLookup<'_> {
        CacheLookup::new(self.index.as_ref(), self.allocator.as_ref())
    }

    pub(crate) fn inserter(&self) -> Inserter<'_> {
        Inserter::new(
            self.cache.as_ref(),
            self.index.as_ref(),
            self.allocator.as_ref(),
            self.journal.as_ref(),
            &self.congestion,
        )
        .checksums(self.config.data_checksums)
        .max_batch(self.config.max_batch_records)
    }

    pub(crate) fn writeback(&self) -> Writeback<'_> {
        Writeback::new(
            self.backing.as_ref(),
            self.cache.as_ref(),
            self.index.as_ref(),
            self.allocator.as_ref(),
            &self.stats,
        )
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn index(&self) -> &dyn KeyIndex {
        self.index.as_ref()
    }

    pub fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::Acquire)
    }

    /// Requests currently admitted
    pub fn pending(&self) -> usize {
        self.admission.pending()
    }

    /// Current congestion score
    pub fn congestion(&self) -> u32 {
        self.congestion.is_congested()
    }
}
