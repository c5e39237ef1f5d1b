//! Journal writer
//!
//! Handles appending entries to the journal file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::JournalSyncStrategy;
use crate::error::{CacheError, Result};

use super::{JournalEntry, JournalOp};

/// Writes entries to the journal file
pub struct JournalWriter {
    file: BufWriter<File>,
    next_lsn: u64,
    sync_strategy: JournalSyncStrategy,

    /// Entries appended since the last fsync
    unsynced: usize,
}

impl JournalWriter {
    /// Open or create the journal for appending, numbering from `next_lsn`
    pub fn open(path: &Path, sync_strategy: JournalSyncStrategy, next_lsn: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: BufWriter::new(file),
            next_lsn: next_lsn.max(1),
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append an entry, returning its LSN
    pub fn append(&mut self, op: JournalOp) -> Result<u64> {
        let lsn = self.next_lsn;
        let frame = JournalEntry::new(lsn, op).encode()?;

        self.file
            .write_all(&frame)
            .and_then(|_| self.file.flush())
            .map_err(|e| CacheError::JournalWrite(format!("LSN {}: {}", lsn, e)))?;
        self.next_lsn += 1;
        self.unsynced += 1;

        let due = match self.sync_strategy {
            JournalSyncStrategy::EveryWrite => true,
            JournalSyncStrategy::EveryNEntries { count } => self.unsynced >= count,
        };
        if due {
            self.sync()?;
        }
        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// The LSN the next append will get
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }
}
