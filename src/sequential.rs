//! Sequential-Access Detector
//!
//! Remembers, per caller, where its last request ended and how long its
//! current contiguous run is. Long runs (streaming reads/writes, backups)
//! would flush useful data out of the cache for little gain, so they are
//! routed around it.
//!
//! The history is a bounded LRU: the least recently active caller is
//! forgotten first.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::Config;
use crate::congestion::bypass_threshold;
use crate::extent::{ExtentKey, SECTOR_SHIFT};

/// Identity of whoever issued a request (task, thread, client)
pub type CallerId = u64;

/// Weight of the running average of finished runs
const AVERAGE_WEIGHT: u64 = 8;

#[derive(Debug, Clone, Copy)]
struct StreamHistory {
    inode: u64,

    /// End sector of the caller's last request
    last_end: u64,

    /// Bytes in the current contiguous run
    sequential: u64,

    /// Decayed average of previous runs, in bytes
    average: u64,

    expires: Instant,
}

/// What the detector thinks of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Cache,

    /// Run length reached the sequential cutoff
    BypassSequential,

    /// Run length reached the congestion-scaled threshold
    BypassCongested,
}

impl Classification {
    pub fn is_bypass(&self) -> bool {
        !matches!(self, Classification::Cache)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialDecision {
    pub classification: Classification,

    /// Smoothed run length this request was judged by
    pub sequential_sectors: u64,
}

/// Per-caller sequential stream tracker
pub struct SequentialDetector {
    cutoff_sectors: u64,
    expiry: Duration,
    history: Mutex<LruCache<CallerId, StreamHistory>>,
}

impl SequentialDetector {
    /// `cutoff` in bytes (0 disables), `capacity` callers remembered
    pub fn new(cutoff: u64, expiry: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cutoff_sectors: cutoff >> SECTOR_SHIFT,
            expiry,
            history: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.sequential_cutoff,
            config.sequential_expiry,
            config.sequential_history,
        )
    }

    /// Number of callers currently remembered
    pub fn tracked(&self) -> usize {
        self.history.lock().len()
    }

    pub fn classify(
        &self,
        caller: CallerId,
        extent: &ExtentKey,
        congestion: u32,
    ) -> SequentialDecision {
        self.classify_at(caller, extent, congestion, Instant::now())
    }

    /// `classify` with an explicit clock
    pub fn classify_at(
        &self,
        caller: CallerId,
        extent: &ExtentKey,
        congestion: u32,
        now: Instant,
    ) -> SequentialDecision {
        if self.cutoff_sectors == 0 && congestion == 0 {
            return SequentialDecision {
                classification: Classification::Cache,
                sequential_sectors: 0,
            };
        }

        let run_bytes = {
            let mut history = self.history.lock();
            let mut entry = match history.get(&caller) {
                Some(h) if h.inode == extent.inode
                    && h.last_end == extent.start()
                    && now < h.expires =>
                {
                    *h
                }
                Some(h) => StreamHistory {
                    sequential: 0,
                    average: ewma(h.average, h.sequential),
                    ..*h
                },
                None => StreamHistory {
                    inode: extent.inode,
                    last_end: 0,
                    sequential: 0,
                    average: 0,
                    expires: now,
                },
            };

            entry.inode = extent.inode;
            entry.sequential = entry.sequential.saturating_add(extent.byte_len());
            entry.last_end = extent.end();
            entry.expires = now + self.expiry;
            history.put(caller, entry);

            entry.sequential.max(entry.average)
        };

        let sectors = run_bytes >> SECTOR_SHIFT;
        let classification = if self.cutoff_sectors != 0 && sectors >= self.cutoff_sectors {
            Classification::BypassSequential
        } else if congestion != 0 && sectors >= bypass_threshold(congestion) {
            Classification::BypassCongested
        } else {
            Classification::Cache
        };

        SequentialDecision {
            classification,
            sequential_sectors: sectors,
        }
    }
}

fn ewma(average: u64, sample: u64) -> u64 {
    (average * (AVERAGE_WEIGHT - 1) + sample) / AVERAGE_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::CONGESTION_MAX;

    const KIB: u64 = 1024;

    fn detector(cutoff: u64) -> SequentialDetector {
        SequentialDetector::new(cutoff, Duration::from_secs(5), 4)
    }

    /// 64 KiB extent starting at `offset_kib`
    fn extent(offset_kib: u64) -> ExtentKey {
        ExtentKey::from_bytes(1, offset_kib * KIB, 64 * KIB).unwrap()
    }

    #[test]
    fn test_contiguous_run_reaches_cutoff() {
        let det = detector(256 * KIB);
        let now = Instant::now();

        for i in 0..3 {
            let d = det.classify_at(7, &extent(i * 64), 0, now);
            assert_eq!(d.classification, Classification::Cache);
        }
        let d = det.classify_at(7, &extent(192), 0, now);
        assert_eq!(d.classification, Classification::BypassSequential);
        assert_eq!(d.sequential_sectors, 512);
    }

    #[test]
    fn test_gap_resets_run() {
        let det = detector(256 * KIB);
        let now = Instant::now();

        det.classify_at(7, &extent(0), 0, now);
        det.classify_at(7, &extent(64), 0, now);
        // jump
        det.classify_at(7, &extent(1024), 0, now);
        let d = det.classify_at(7, &extent(1088), 0, now);
        assert_eq!(d.classification, Classification::Cache);
        assert_eq!(d.sequential_sectors, 256);
    }

    #[test]
    fn test_callers_are_tracked_independently() {
        let det = detector(128 * KIB);
        let now = Instant::now();

        det.classify_at(1, &extent(0), 0, now);
        let other = det.classify_at(2, &extent(64), 0, now);
        assert_eq!(other.classification, Classification::Cache);

        let same = det.classify_at(1, &extent(64), 0, now);
        assert_eq!(same.classification, Classification::BypassSequential);
    }

    #[test]
    fn test_expired_history_does_not_continue() {
        let det = detector(128 * KIB);
        let now = Instant::now();

        det.classify_at(1, &extent(0), 0, now);
        let later = now + Duration::from_secs(6);
        let d = det.classify_at(1, &extent(64), 0, later);
        assert_eq!(d.classification, Classification::Cache);
    }

    #[test]
    fn test_history_is_bounded() {
        let det = detector(128 * KIB);
        let now = Instant::now();
        for caller in 0..10 {
            det.classify_at(caller, &extent(0), 0, now);
        }
        assert_eq!(det.tracked(), 4);

        // Caller 0 was evicted, so its continuation starts a fresh run
        let d = det.classify_at(0, &extent(64), 0, now);
        assert_eq!(d.classification, Classification::Cache);
    }

    #[test]
    fn test_congestion_lowers_the_bar() {
        let det = detector(0);
        let now = Instant::now();

        let calm = det.classify_at(1, &extent(0), 0, now);
        assert_eq!(calm.classification, Classification::Cache);

        let busy = det.classify_at(1, &extent(0), CONGESTION_MAX, now);
        assert_eq!(busy.classification, Classification::BypassCongested);
    }

    #[test]
    fn test_disabled_detector_keeps_no_history() {
        let det = detector(0);
        det.classify(1, &extent(0), 0);
        assert_eq!(det.tracked(), 0);
    }
}
