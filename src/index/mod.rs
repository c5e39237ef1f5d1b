//! Key-Range Index Module
//!
//! Maps logical extents to pointer records.
//!
//! ## Responsibilities
//! - Keep committed keys of one inode non-overlapping (copy-on-overlap:
//!   a new key trims or splits whatever it covers)
//! - Ordered overlap queries
//! - Conditional replacement (`replace_if_unchanged`), which is the only
//!   cross-request ordering primitive: last committed wins, and a writer that
//!   lost the race sees `collided`
//!
//! The request layer only talks to the `KeyIndex` trait; `ExtentTree` is the
//! in-memory implementation.

mod tree;

use async_trait::async_trait;

use crate::error::Result;
use crate::extent::{ExtentKey, PointerRecord};

pub use tree::ExtentTree;

/// Outcome of an index mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexUpdate {
    /// At least one key was skipped because its range changed since the
    /// `replace_if_unchanged` record was read
    pub collided: bool,

    /// Portions of previously committed records that were overwritten
    pub displaced: Vec<PointerRecord>,
}

/// Extent -> cache location index. Internally thread-safe.
#[async_trait]
pub trait KeyIndex: Send + Sync {
    /// Commit a batch of records.
    ///
    /// With `replace_if_unchanged`, each record is only committed if its
    /// range is still entirely covered by (pieces of) that record.
    async fn insert(
        &self,
        batch: &[PointerRecord],
        replace_if_unchanged: Option<&PointerRecord>,
    ) -> Result<IndexUpdate>;

    /// Records overlapping `extent`, ascending by offset, unclipped
    async fn query_overlap(&self, extent: &ExtentKey) -> Result<Vec<PointerRecord>>;

    /// Install a read-miss placeholder if the range holds no real records.
    /// Older placeholders in the range are overwritten.
    async fn reserve(&self, placeholder: &PointerRecord) -> Result<bool>;

    /// Drop everything in `extent`, returning what was removed
    async fn invalidate(&self, extent: &ExtentKey) -> Result<Vec<PointerRecord>>;

    /// Up to `limit` dirty records strictly after `after`, in key order
    async fn scan_dirty(
        &self,
        after: Option<ExtentKey>,
        limit: usize,
    ) -> Result<Vec<PointerRecord>>;
}
