//! BTreeMap-backed extent index
//!
//! Records are keyed by `(inode, start)`. Because committed keys never
//! overlap, at most one record starting before a query range can reach into
//! it, so an overlap query is one predecessor lookup plus a range scan.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::extent::{ExtentKey, PointerRecord};

use super::{IndexUpdate, KeyIndex};

type Slot = (u64, u64);

#[inline]
fn slot(key: &ExtentKey) -> Slot {
    (key.inode, key.offset)
}

/// In-memory ordered extent index
#[derive(Default)]
pub struct ExtentTree {
    records: RwLock<BTreeMap<Slot, PointerRecord>>,
}

impl ExtentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records (placeholders included)
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every record in key order
    pub fn records(&self) -> Vec<PointerRecord> {
        self.records.read().values().copied().collect()
    }

    /// Total dirty sectors currently indexed
    pub fn dirty_sectors(&self) -> u64 {
        self.records
            .read()
            .values()
            .filter(|r| r.dirty)
            .map(|r| r.key.len)
            .sum()
    }

    fn overlapping(map: &BTreeMap<Slot, PointerRecord>, extent: &ExtentKey) -> Vec<PointerRecord> {
        let mut out = Vec::new();
        if extent.is_empty() {
            return out;
        }

        if let Some((_, prev)) = map.range(..slot(extent)).next_back() {
            if prev.key.overlaps(extent) {
                out.push(*prev);
            }
        }
        let end = (extent.inode, extent.end());
        out.extend(map.range(slot(extent)..end).map(|(_, r)| *r));
        out
    }

    /// Remove `extent` from the map, keeping the uncovered head/tail of any
    /// record that straddles it. Returns the removed pieces.
    fn punch(map: &mut BTreeMap<Slot, PointerRecord>, extent: &ExtentKey) -> Vec<PointerRecord> {
        let mut displaced = Vec::new();
        for r in Self::overlapping(map, extent) {
            map.remove(&slot(&r.key));

            if r.key.start() < extent.start() {
                let head = r.clip(r.key.start(), extent.start());
                map.insert(slot(&head.key), head);
            }
            if r.key.end() > extent.end() {
                let tail = r.clip(extent.end(), r.key.end());
                map.insert(slot(&tail.key), tail);
            }
            displaced.push(r.clip(extent.start(), extent.end()));
        }
        displaced
    }

    /// Is `key` still exactly what `origin` left behind?
    fn unchanged(
        map: &BTreeMap<Slot, PointerRecord>,
        key: &ExtentKey,
        origin: &PointerRecord,
    ) -> bool {
        let mut cursor = key.start();
        for r in Self::overlapping(map, key) {
            if !r.derives_from(origin) || r.key.start() > cursor {
                return false;
            }
            cursor = r.key.end();
        }
        cursor >= key.end()
    }
}

#[async_trait]
impl KeyIndex for ExtentTree {
    async fn insert(
        &self,
        batch: &[PointerRecord],
        replace_if_unchanged: Option<&PointerRecord>,
    ) -> Result<IndexUpdate> {
        let mut update = IndexUpdate::default();
        let mut map = self.records.write();

        for record in batch.iter().filter(|r| !r.key.is_empty()) {
            if let Some(origin) = replace_if_unchanged {
                if !Self::unchanged(&map, &record.key, origin) {
                    update.collided = true;
                    continue;
                }
            }
            update.displaced.extend(Self::punch(&mut map, &record.key));
            map.insert(slot(&record.key), *record);
        }

        Ok(update)
    }

    async fn query_overlap(&self, extent: &ExtentKey) -> Result<Vec<PointerRecord>> {
        Ok(Self::overlapping(&self.records.read(), extent))
    }

    async fn reserve(&self, placeholder: &PointerRecord) -> Result<bool> {
        let mut map = self.records.write();
        if Self::overlapping(&map, &placeholder.key)
            .iter()
            .any(|r| !r.is_placeholder())
        {
            return Ok(false);
        }
        Self::punch(&mut map, &placeholder.key);
        map.insert(slot(&placeholder.key), *placeholder);
        Ok(true)
    }

    async fn invalidate(&self, extent: &ExtentKey) -> Result<Vec<PointerRecord>> {
        Ok(Self::punch(&mut self.records.write(), extent))
    }

    async fn scan_dirty(
        &self,
        after: Option<ExtentKey>,
        limit: usize,
    ) -> Result<Vec<PointerRecord>> {
        let map = self.records.read();
        let lower = match after {
            Some(key) => Excluded(slot(&key)),
            None => Unbounded,
        };
        Ok(map
            .range((lower, Unbounded))
            .map(|(_, r)| *r)
            .filter(|r| r.dirty)
            .take(limit)
            .collect())
    }
}
