//! In-memory block device
//!
//! RAM-backed device with I/O counters, latency and fault injection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;

use super::{check_range, BlockDevice};

/// Snapshot of a device's I/O counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub discards: u64,
}

/// RAM-backed block device
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    latency: Option<Duration>,

    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    flushes: AtomicU64,
    discards: AtomicU64,

    /// Number of upcoming reads to fail
    failing_reads: AtomicU32,
    failing_writes: AtomicBool,
}

impl MemoryDevice {
    /// Zero-filled device of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
            latency: None,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            failing_reads: AtomicU32::new(0),
            failing_writes: AtomicBool::new(false),
        }
    }

    /// Delay every I/O by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` reads with an I/O error
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Fail all writes until turned off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.failing_writes.store(fail, Ordering::SeqCst);
    }

    /// Zero the entire device (simulates losing the cache)
    pub fn wipe(&self) {
        self.data.write().fill(0);
    }

    /// Synchronous read for inspection
    pub fn snapshot(&self, offset: u64, len: u64) -> Vec<u8> {
        let data = self.data.read();
        data[offset as usize..(offset + len) as usize].to_vec()
    }

    pub fn counters(&self) -> DeviceCounters {
        DeviceCounters {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_read_fault(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    fn len_bytes(&self) -> u64 {
        self.data.read().len() as u64
    }

    async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes> {
        self.delay().await;
        check_range(offset, len, self.len_bytes())?;
        if self.take_read_fault() {
            return Err(std::io::Error::other("injected read fault").into());
        }

        let out = {
            let data = self.data.read();
            Bytes::copy_from_slice(&data[offset as usize..(offset + len) as usize])
        };
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len, Ordering::Relaxed);
        Ok(out)
    }

    async fn write_at(&self, offset: u64, buf: Bytes) -> Result<()> {
        self.delay().await;
        let len = buf.len() as u64;
        check_range(offset, len, self.len_bytes())?;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("injected write fault").into());
        }

        {
            let mut data = self.data.write();
            data[offset as usize..(offset + len) as usize].copy_from_slice(&buf);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.delay().await;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn discard(&self, offset: u64, len: u64) -> Result<()> {
        check_range(offset, len, self.len_bytes())?;
        {
            let mut data = self.data.write();
            data[offset as usize..(offset + len) as usize].fill(0);
        }
        self.discards.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
