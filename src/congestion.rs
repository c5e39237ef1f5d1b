//! Congestion Estimator
//!
//! Tracks how far cache-device completions have been running over the
//! latency high watermark, as a decayed "debt" counter.
//!
//! - A completion slower than `high_us` adds `latency / 1024` units of debt
//!   (capped at `CONGESTED_MAX` total) and restarts the decay clock.
//! - A completion faster than `low_us` pays back one unit.
//! - Debt also drains by one unit per ~1 ms since the last slow completion.
//!
//! The score folds debt through `fract_exp_two`, so it grows roughly
//! exponentially with debt. Readers and writers never lock; concurrent
//! updates may interleave, and an approximate score is fine.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use crate::config::Config;

/// Debt ceiling
pub const CONGESTED_MAX: i64 = 1024;

const FRACT_BITS: u32 = 6;

/// Highest score `is_congested` can return
pub const CONGESTION_MAX: u32 = fract_exp_two(CONGESTED_MAX as u32, FRACT_BITS);

/// `2^(x / 2^fract_bits)`, with the fractional part linearly interpolated
pub const fn fract_exp_two(x: u32, fract_bits: u32) -> u32 {
    let fract = x & ((1 << fract_bits) - 1);
    let whole = 1u32 << (x >> fract_bits);
    whole + ((whole * fract) >> fract_bits)
}

/// Sequential run length (sectors) above which a request bypasses the cache
/// at the given congestion score. Higher congestion, lower threshold.
pub fn bypass_threshold(score: u32) -> u64 {
    if score == 0 {
        return u64::MAX;
    }
    u64::from((CONGESTION_MAX / score).max(1))
}

/// Process-wide decayed latency tracker
pub struct CongestionEstimator {
    high_us: u64,
    low_us: u64,
    jitter: bool,
    epoch: Instant,

    /// Outstanding debt, stored negated (0 = idle)
    congested: CachePadded<AtomicI64>,

    /// Microseconds since `epoch` of the last over-watermark sample
    last_us: CachePadded<AtomicU64>,
}

impl CongestionEstimator {
    pub fn new(high_us: u64, low_us: u64, jitter: bool) -> Self {
        Self {
            high_us,
            low_us,
            jitter,
            epoch: Instant::now(),
            congested: CachePadded::new(AtomicI64::new(0)),
            last_us: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.congestion_high_us,
            config.congestion_low_us,
            config.congestion_jitter,
        )
    }

    /// Microseconds since this estimator was created
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Fold in one completion latency
    pub fn sample(&self, latency: Duration) {
        self.sample_at(latency.as_micros() as u64, self.now_us());
    }

    /// `sample` with an explicit clock
    pub fn sample_at(&self, latency_us: u64, now_us: u64) {
        if self.high_us == 0 {
            return;
        }

        let current = self.congested.load(Ordering::Relaxed);
        if latency_us > self.high_us {
            let ms = (latency_us / 1024) as i64;
            let ms = ms.min(CONGESTED_MAX + current);
            self.last_us.store(now_us, Ordering::Relaxed);
            self.congested.fetch_sub(ms, Ordering::Relaxed);
        } else if latency_us < self.low_us && current < 0 {
            self.congested.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 0 when idle, otherwise `1..=CONGESTION_MAX`, higher is worse.
    ///
    /// With jitter enabled the score loses up to 32 at random, so a higher
    /// debt only guarantees a score at least as high when jitter is off.
    pub fn is_congested(&self) -> u32 {
        self.congestion_at(self.now_us())
    }

    /// `is_congested` with an explicit clock
    pub fn congestion_at(&self, now_us: u64) -> u32 {
        let debt = self.debt_at(now_us);
        if debt == 0 {
            return 0;
        }

        let score = fract_exp_two(debt, FRACT_BITS);
        if self.jitter {
            score
                .saturating_sub(rand::random::<u32>().count_ones())
                .max(1)
        } else {
            score
        }
    }

    fn debt_at(&self, now_us: u64) -> u32 {
        if self.high_us == 0 {
            return 0;
        }
        let last = self.last_us.load(Ordering::Relaxed);
        let drained = (now_us.saturating_sub(last) / 1024) as i64;
        let remaining = drained + self.congested.load(Ordering::Relaxed);
        if remaining >= 0 {
            0
        } else {
            (-remaining).min(CONGESTED_MAX) as u32
        }
    }
}
