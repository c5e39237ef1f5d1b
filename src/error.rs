//! Error types for the lookaside cache
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Device Errors
    // -------------------------------------------------------------------------
    #[error("Backing device error: {0}")]
    BackingDevice(String),

    #[error("Cache device error: {0}")]
    CacheDevice(String),

    #[error("Access beyond end of device: offset={offset} len={len} size={size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    // -------------------------------------------------------------------------
    // Journal Errors
    // -------------------------------------------------------------------------
    #[error("Journal corruption detected: {0}")]
    JournalCorruption(String),

    #[error("Journal write failed: {0}")]
    JournalWrite(String),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("Cache space exhausted")]
    AllocExhausted,

    #[error("Stale bucket reference: bucket {bucket} gen {gen}")]
    StaleBucket { bucket: u32, gen: u8 },

    // -------------------------------------------------------------------------
    // Data Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Checksum mismatch at cache sector {sector}")]
    ChecksumMismatch { sector: u64 },

    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Runtime Errors
    // -------------------------------------------------------------------------
    #[error("Background task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Transient device failures that may be re-resolved against the other device
    pub fn is_recoverable_read(&self) -> bool {
        matches!(
            self,
            CacheError::CacheDevice(_)
                | CacheError::ChecksumMismatch { .. }
                | CacheError::StaleBucket { .. }
        )
    }

    /// Whether this error means the allocator could not grant cache space
    pub fn is_alloc_exhausted(&self) -> bool {
        matches!(self, CacheError::AllocExhausted)
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(e: tokio::task::JoinError) -> Self {
        CacheError::Task(e.to_string())
    }
}
