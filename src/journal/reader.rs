//! Journal reader
//!
//! Sequentially decodes frames from the journal file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{CacheError, Result};

use super::{JournalEntry, HEADER_SIZE};

/// Reads entries from the journal file
pub struct JournalReader {
    reader: BufReader<File>,

    /// Byte offset just past the last fully decoded entry
    position: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            position: 0,
        })
    }

    /// Offset of the end of the valid prefix read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next entry. `Ok(None)` at a clean end of file; a torn or
    /// corrupt frame is an error.
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        let got = self.read_fully(&mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(CacheError::JournalCorruption(format!(
                "torn header at offset {}",
                self.position
            )));
        }

        let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
        let crc = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
        let len = u32::from_le_bytes(header[12..16].try_into().unwrap_or_default()) as usize;

        let mut data = vec![0u8; len];
        if self.read_fully(&mut data)? < len {
            return Err(CacheError::JournalCorruption(format!(
                "torn payload for LSN {} at offset {}",
                lsn, self.position
            )));
        }

        let entry = JournalEntry::decode(lsn, crc, &data)?;
        self.position += (HEADER_SIZE + len) as u64;
        Ok(Some(entry))
    }

    /// Like `read_exact`, but reports how much was read before EOF
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
