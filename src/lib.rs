//! # lookaside
//!
//! Request layer of a block-level look-aside cache: a fast cache device in
//! front of a slow backing device.
//! - Per-request bypass/admission decisions (alignment, fullness, sequential
//!   streams, congestion)
//! - Read lookup with stale-pointer detection and read-miss fills
//! - Write-through, write-back and write-around writes
//! - Journal-before-index insertion with crash recovery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Request Router                         │
//! │        (admission gate, bypass decision, exactly-once ack)  │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!  │ Sequential  │        │   Lookup    │        │  Insertion  │
//!  │ Congestion  │        │  Pipeline   │        │   Engine    │
//!  └─────────────┘        └──────┬──────┘        └──────┬──────┘
//!                                │                      │
//!                 ┌──────────────┼──────────┬───────────┼──────────┐
//!                 ▼              ▼          ▼           ▼          ▼
//!          ┌───────────┐  ┌───────────┐ ┌────────┐ ┌─────────┐ ┌─────────┐
//!          │   Index   │  │ Allocator │ │Journal │ │  Cache  │ │ Backing │
//!          │ (extents) │  │ (buckets) │ │ (log)  │ │ device  │ │ device  │
//!          └───────────┘  └───────────┘ └────────┘ └─────────┘ └─────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod extent;
pub mod device;
pub mod index;
pub mod alloc;
pub mod journal;

pub mod congestion;
pub mod sequential;
pub mod lookup;
pub mod insert;
pub mod writeback;
pub mod request;
pub mod stats;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{CacheMode, Config};
pub use engine::CacheEngine;
pub use error::{CacheError, Result};
pub use extent::{ExtentKey, PointerRecord};
pub use request::{BypassReason, Completion, IoFlags, IoOp, IoRequest, IoResult};
pub use stats::StatsSnapshot;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of lookaside
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
