//! Journal Module
//!
//! Durability log for index mutations. Every non-fill insert and every
//! invalidation is appended here, and the append completes, before the index
//! is touched, so the index can be rebuilt from the log alone after a crash.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! Data is the bincode-encoded entry; CRC32 covers Data.

mod entry;
mod reader;
mod recovery;
mod writer;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::JournalSyncStrategy;
use crate::error::Result;
use crate::extent::PointerRecord;

pub use entry::{JournalEntry, JournalOp, HEADER_SIZE};
pub use reader::JournalReader;
pub use recovery::{JournalRecovery, RecoveryResult};
pub use writer::JournalWriter;

/// Append-only durability log
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append `op`; resolves once it is in the log. Returns its LSN.
    async fn append(&self, op: JournalOp) -> Result<u64>;

    /// Force everything appended so far to stable storage
    async fn flush(&self) -> Result<()>;

    /// Append a pointer-record batch
    async fn append_batch(&self, records: &[PointerRecord]) -> Result<u64> {
        self.append(JournalOp::Insert {
            records: records.to_vec(),
        })
        .await
    }
}

/// File-backed journal. Blocking file I/O runs on tokio's blocking pool.
pub struct FileJournal {
    writer: Arc<Mutex<JournalWriter>>,
}

impl FileJournal {
    /// Recover the log at `path` (truncating any torn tail) and open it for
    /// appending. Returns the surviving entries for replay.
    pub fn open(
        path: &Path,
        sync_strategy: JournalSyncStrategy,
    ) -> Result<(Self, Vec<JournalEntry>, RecoveryResult)> {
        let (entries, result) = if path.exists() {
            JournalRecovery::recover(path)?
        } else {
            (Vec::new(), RecoveryResult::default())
        };

        let writer = JournalWriter::open(path, sync_strategy, result.last_lsn + 1)?;
        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
            },
            entries,
            result,
        ))
    }

    /// LSN the next append will get
    pub fn next_lsn(&self) -> u64 {
        self.writer.lock().current_lsn()
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, op: JournalOp) -> Result<u64> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || writer.lock().append(op)).await?
    }

    async fn flush(&self) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || writer.lock().sync()).await?
    }
}
