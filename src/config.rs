//! Configuration for the lookaside cache
//!
//! Centralized configuration with sensible defaults. These are the knobs the
//! request layer consumes; it never owns or persists them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::extent::SECTOR_SIZE;

/// Main configuration for a cached volume
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------
    /// How writes that are not bypassed are committed
    pub cache_mode: CacheMode,

    /// Alignment unit (bytes) for cacheable I/O. Anything not aligned to it
    /// is always bypassed.
    pub block_size: u64,

    /// Percentage of buckets in use above which nothing new is cached
    pub cache_full_cutoff_percent: u8,

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------
    /// Bucket size in sectors
    pub bucket_size: u64,

    /// Buckets held back for dirty (write-back) allocations
    pub reserve_buckets: usize,

    /// Compute crc32 over data written to the cache device.
    ///
    /// Without it a cache device that lost or zeroed its contents is served
    /// as-is; with it such reads fall back to the backing device.
    pub data_checksums: bool,

    /// Max pointer records per index commit
    pub max_batch_records: usize,

    // -------------------------------------------------------------------------
    // Sequential Detection
    // -------------------------------------------------------------------------
    /// Sequential streams at least this long (bytes) bypass the cache. 0 disables.
    pub sequential_cutoff: u64,

    /// How long a caller's stream stays eligible for continuation
    pub sequential_expiry: Duration,

    /// Number of callers tracked
    pub sequential_history: usize,

    // -------------------------------------------------------------------------
    // Congestion
    // -------------------------------------------------------------------------
    /// Completion latency (us) above which the cache counts as congested.
    /// 0 disables congestion tracking.
    pub congestion_high_us: u64,

    /// Completion latency (us) below which accumulated congestion decays
    pub congestion_low_us: u64,

    /// Perturb the congestion score to avoid lockstep decisions
    pub congestion_jitter: bool,

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------
    /// In-flight request count at which new requests start parking
    pub pending_high_watermark: usize,

    /// In-flight request count at which parked requests are released
    pub pending_low_watermark: usize,

    // -------------------------------------------------------------------------
    // Journal / Writeback
    // -------------------------------------------------------------------------
    /// Path of the durability log
    pub journal_path: PathBuf,

    /// Sync strategy: how often to fsync the journal
    pub journal_sync: JournalSyncStrategy,

    /// Dirty records flushed per writeback pass
    pub writeback_batch: usize,
}

/// Per-volume cache mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Commit to backing storage synchronously, mirror into the cache
    WriteThrough,

    /// Commit to the cache device only and mark dirty
    WriteBack,

    /// Writes go to backing storage only; reads still populate the cache
    WriteAround,

    /// Cache disabled for population
    None,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheMode::WriteThrough => "writethrough",
            CacheMode::WriteBack => "writeback",
            CacheMode::WriteAround => "writearound",
            CacheMode::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writethrough" => Ok(CacheMode::WriteThrough),
            "writeback" => Ok(CacheMode::WriteBack),
            "writearound" => Ok(CacheMode::WriteAround),
            "none" => Ok(CacheMode::None),
            other => Err(CacheError::Config(format!("unknown cache mode '{}'", other))),
        }
    }
}

/// Journal sync strategy
#[derive(Debug, Clone, Copy)]
pub enum JournalSyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::WriteThrough,
            block_size: 4096,
            cache_full_cutoff_percent: 95,
            bucket_size: 1024, // 512 KiB
            reserve_buckets: 2,
            data_checksums: true,
            max_batch_records: 256,
            sequential_cutoff: 4 * 1024 * 1024,
            sequential_expiry: Duration::from_secs(5),
            sequential_history: 64,
            congestion_high_us: 2000,
            congestion_low_us: 1000,
            congestion_jitter: true,
            pending_high_watermark: 1024,
            pending_low_watermark: 768,
            journal_path: PathBuf::from("./lookaside_journal.log"),
            journal_sync: JournalSyncStrategy::EveryNEntries { count: 64 },
            writeback_batch: 64,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Alignment unit in sectors
    pub fn block_sectors(&self) -> u64 {
        self.block_size / SECTOR_SIZE
    }

    /// Reject combinations the request path cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.block_size < SECTOR_SIZE
            || !self.block_size.is_power_of_two()
            || self.block_size % SECTOR_SIZE != 0
        {
            return Err(CacheError::Config(format!(
                "block_size {} must be a power of two >= {}",
                self.block_size, SECTOR_SIZE
            )));
        }
        if self.bucket_size == 0 || self.bucket_size % self.block_sectors() != 0 {
            return Err(CacheError::Config(format!(
                "bucket_size {} must be a non-zero multiple of the block size",
                self.bucket_size
            )));
        }
        if self.cache_full_cutoff_percent > 100 {
            return Err(CacheError::Config(
                "cache_full_cutoff_percent must be <= 100".to_string(),
            ));
        }
        if self.pending_low_watermark > self.pending_high_watermark
            || self.pending_high_watermark == 0
        {
            return Err(CacheError::Config(format!(
                "pending watermarks invalid: low={} high={}",
                self.pending_low_watermark, self.pending_high_watermark
            )));
        }
        if self.congestion_low_us > self.congestion_high_us {
            return Err(CacheError::Config(format!(
                "congestion watermarks invalid: low={} high={}",
                self.congestion_low_us, self.congestion_high_us
            )));
        }
        if self.max_batch_records == 0 || self.sequential_history == 0 {
            return Err(CacheError::Config(
                "max_batch_records and sequential_history must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.config.cache_mode = mode;
        self
    }

    /// Set the caching alignment unit (in bytes)
    pub fn block_size(mut self, bytes: u64) -> Self {
        self.config.block_size = bytes;
        self
    }

    pub fn cache_full_cutoff_percent(mut self, percent: u8) -> Self {
        self.config.cache_full_cutoff_percent = percent;
        self
    }

    /// Set the bucket size (in sectors)
    pub fn bucket_size(mut self, sectors: u64) -> Self {
        self.config.bucket_size = sectors;
        self
    }

    pub fn reserve_buckets(mut self, count: usize) -> Self {
        self.config.reserve_buckets = count;
        self
    }

    pub fn data_checksums(mut self, enabled: bool) -> Self {
        self.config.data_checksums = enabled;
        self
    }

    pub fn max_batch_records(mut self, count: usize) -> Self {
        self.config.max_batch_records = count;
        self
    }

    /// Set the sequential cutoff (in bytes)
    pub fn sequential_cutoff(mut self, bytes: u64) -> Self {
        self.config.sequential_cutoff = bytes;
        self
    }

    pub fn sequential_expiry(mut self, expiry: Duration) -> Self {
        self.config.sequential_expiry = expiry;
        self
    }

    pub fn sequential_history(mut self, entries: usize) -> Self {
        self.config.sequential_history = entries;
        self
    }

    /// Set the congestion watermarks (in microseconds)
    pub fn congestion_watermarks(mut self, low_us: u64, high_us: u64) -> Self {
        self.config.congestion_low_us = low_us;
        self.config.congestion_high_us = high_us;
        self
    }

    pub fn congestion_jitter(mut self, enabled: bool) -> Self {
        self.config.congestion_jitter = enabled;
        self
    }

    /// Set the admission watermarks (in-flight request counts)
    pub fn pending_watermarks(mut self, low: usize, high: usize) -> Self {
        self.config.pending_low_watermark = low;
        self.config.pending_high_watermark = high;
        self
    }

    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.journal_path = path.into();
        self
    }

    pub fn journal_sync(mut self, strategy: JournalSyncStrategy) -> Self {
        self.config.journal_sync = strategy;
        self
    }

    pub fn writeback_batch(mut self, count: usize) -> Self {
        self.config.writeback_batch = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
