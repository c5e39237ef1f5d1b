//! Request-path counters
//!
//! Relaxed atomic counters bumped on the hot path; `snapshot` gives a
//! consistent-enough copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Debug, Default)]
pub struct CacheStats {
    cache_hit_sectors: CachePadded<AtomicU64>,
    cache_miss_sectors: CachePadded<AtomicU64>,
    bypass_sequential: AtomicU64,
    bypass_congested: AtomicU64,
    bypass_other: AtomicU64,
    forced_writeback: AtomicU64,
    stale_pointers: AtomicU64,
    read_retries: AtomicU64,
    collisions: AtomicU64,
    insert_failures: AtomicU64,
    writeback_sectors: AtomicU64,
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hit_sectors: u64,
    pub cache_miss_sectors: u64,
    pub bypass_sequential: u64,
    pub bypass_congested: u64,
    pub bypass_other: u64,
    pub forced_writeback: u64,
    pub stale_pointers: u64,
    pub read_retries: u64,
    pub collisions: u64,
    pub insert_failures: u64,
    pub writeback_sectors: u64,
}

macro_rules! counter {
    ($name:ident) => {
        pub fn $name(&self, n: u64) {
            self.$name.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(cache_hit_sectors);
    counter!(cache_miss_sectors);
    counter!(bypass_sequential);
    counter!(bypass_congested);
    counter!(bypass_other);
    counter!(forced_writeback);
    counter!(stale_pointers);
    counter!(read_retries);
    counter!(collisions);
    counter!(insert_failures);
    counter!(writeback_sectors);

    pub fn snapshot(&self) -> StatsSnapshot {
        fn load(c: &AtomicU64) -> u64 {
            c.load(Ordering::Relaxed)
        }
        StatsSnapshot {
            cache_hit_sectors: load(&self.cache_hit_sectors),
            cache_miss_sectors: load(&self.cache_miss_sectors),
            bypass_sequential: load(&self.bypass_sequential),
            bypass_congested: load(&self.bypass_congested),
            bypass_other: load(&self.bypass_other),
            forced_writeback: load(&self.forced_writeback),
            stale_pointers: load(&self.stale_pointers),
            read_retries: load(&self.read_retries),
            collisions: load(&self.collisions),
            insert_failures: load(&self.insert_failures),
            writeback_sectors: load(&self.writeback_sectors),
        }
    }
}

impl StatsSnapshot {
    /// Fraction of looked-up sectors served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hit_sectors + self.cache_miss_sectors;
        if total == 0 {
            0.0
        } else {
            self.cache_hit_sectors as f64 / total as f64
        }
    }
}
