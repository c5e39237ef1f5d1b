//! Request Module
//!
//! Incoming block I/O and its routing.
//!
//! ## Responsibilities
//! - Describe a request (`IoRequest`) and its completion (`Completion`)
//! - Admission: bound the number of in-flight requests (`AdmissionGate`)
//! - Routing: bypass vs. cache, lookup, insertion, acknowledgement (`router`)
//!
//! ## Request Lifecycle
//! ```text
//!   IoRequest ──► admit ──► classify ──┬─► flush ────────────────┐
//!                                      ├─► read  (lookup/fill) ──┤
//!                                      └─► write (mode/bypass) ──┴─► Completion
//! ```
//!
//! Offsets and lengths are in bytes and must be multiples of 512.

mod admission;
mod router;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::extent::ExtentKey;
use crate::sequential::CallerId;

pub use admission::{AdmissionGate, AdmissionPermit};

/// What a request does
#[derive(Debug, Clone)]
pub enum IoOp {
    Read { len: u64 },
    Write { data: Bytes },
    Discard { len: u64 },

    /// Zero-size flush/barrier
    Flush,
}

/// Request modifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// Flush before this request
    pub preflush: bool,

    /// Force unit access: durable on completion
    pub fua: bool,

    pub sync: bool,

    /// Metadata or priority I/O; exempt from sequential/congestion bypass
    pub meta: bool,
}

/// Why a request skipped the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Discard,
    Detaching,

    /// Cache mode `none`
    Disabled,

    /// Write on a write-around volume
    WriteAround,

    /// Too few reclaimable buckets left
    CacheFull,

    /// Not aligned to the cache block size
    Unaligned,

    Sequential,
    Congested,
}

/// One block I/O
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub caller: CallerId,
    pub inode: u64,

    /// Byte offset on the backing device
    pub offset: u64,

    pub op: IoOp,
    pub flags: IoFlags,
}

impl IoRequest {
    pub fn read(caller: CallerId, inode: u64, offset: u64, len: u64) -> Self {
        Self::new(caller, inode, offset, IoOp::Read { len })
    }

    pub fn write(caller: CallerId, inode: u64, offset: u64, data: impl Into<Bytes>) -> Self {
        Self::new(caller, inode, offset, IoOp::Write { data: data.into() })
    }

    pub fn discard(caller: CallerId, inode: u64, offset: u64, len: u64) -> Self {
        Self::new(caller, inode, offset, IoOp::Discard { len })
    }

    /// Flush barrier; also makes the cache's journal durable
    pub fn flush(caller: CallerId, inode: u64) -> Self {
        Self::new(caller, inode, 0, IoOp::Flush).with_flags(IoFlags {
            preflush: true,
            ..IoFlags::default()
        })
    }

    fn new(caller: CallerId, inode: u64, offset: u64, op: IoOp) -> Self {
        Self {
            caller,
            inode,
            offset,
            op,
            flags: IoFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: IoFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> u64 {
        match &self.op {
            IoOp::Read { len } | IoOp::Discard { len } => *len,
            IoOp::Write { data } => data.len() as u64,
            IoOp::Flush => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sector extent touched by this request
    pub fn extent(&self) -> Result<ExtentKey> {
        ExtentKey::from_bytes(self.inode, self.offset, self.len())
    }
}

/// Read data for reads, `None` for everything else
pub type IoResult = Result<Option<Bytes>>;

/// Exactly-once acknowledgement of a request.
///
/// `complete` consumes the handle, so a request cannot be acknowledged twice.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<IoResult>,
}

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<IoResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn complete(self, result: IoResult) {
        // The originator may have stopped waiting
        let _ = self.tx.send(result);
    }
}
