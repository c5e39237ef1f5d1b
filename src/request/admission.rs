//! Admission gate
//!
//! Counts in-flight requests. Once the count reaches the high watermark the
//! gate closes and new requests park; it reopens when the count falls back to
//! the low watermark. Requests are delayed, never dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use tokio::sync::Notify;

pub struct AdmissionGate {
    pending: CachePadded<AtomicUsize>,
    throttled: AtomicBool,
    high: usize,
    low: usize,

    /// Woken when the gate reopens
    reopened: Notify,

    /// Woken when nothing is in flight
    idle: Notify,
}

/// Held for the lifetime of an admitted request
#[must_use]
pub struct AdmissionPermit<'a> {
    gate: &'a AdmissionGate,
}

impl AdmissionGate {
    /// `high == 0` never throttles
    pub fn new(low: usize, high: usize) -> Self {
        Self {
            pending: CachePadded::new(AtomicUsize::new(0)),
            throttled: AtomicBool::new(false),
            high,
            low: low.min(high),
            reopened: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    /// Wait until the gate is open, then count one more request in flight
    pub async fn admit(&self) -> AdmissionPermit<'_> {
        loop {
            if !self.is_throttled() {
                let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
                let over = self.high != 0 && pending >= self.high;
                if over && !self.throttled.swap(true, Ordering::AcqRel) {
                    tracing::debug!(pending, "admission throttled");
                }
                return AdmissionPermit { gate: self };
            }

            let reopened = self.reopened.notified();
            tokio::pin!(reopened);
            reopened.as_mut().enable();
            if !self.is_throttled() {
                continue;
            }
            reopened.await;
        }
    }

    /// Wait until no request is in flight
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn finish(&self) {
        let pending = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if pending <= self.low && self.throttled.swap(false, Ordering::AcqRel) {
            tracing::debug!(pending, "admission reopened");
            self.reopened.notify_waiters();
        }
        if pending == 0 {
            self.idle.notify_waiters();
        }
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.finish();
    }
}
