//! The logical content index.
//!
//! The live index is the union of all non-superseded index blobs, grouped
//! into epochs. A lookup descends from the newest epoch to the oldest and
//! stops at the first epoch containing the id; within that epoch the entry
//! with the latest timestamp wins, and a winning tombstone makes the content
//! invisible. The in-memory view is immutable; refreshing produces a new
//! [CombinedIndex] swapped in behind an `Arc`.

use std::collections::BTreeMap;

use crate::content_id::{Category, ContentId};
use crate::file_formats::{ENTRY_FLAG_DELETED, ENTRY_FLAG_ECC};
use crate::pack::PackId;

pub mod epoch;
pub mod format;
pub mod upgrade;

pub use epoch::EpochManager;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ContentId,
    pub flags: u8,
    pub format_version: u8,
    pub pack_id: PackId,
    pub pack_offset: u32,
    pub packed_length: u32,
    pub original_length: u32,
    /// Unix seconds; drives last-writer-wins and tombstone resolution.
    pub timestamp: u32,
    pub compression_id: u32,
    pub encryption_key_id: u32,
}

impl IndexEntry {
    pub fn is_deleted(&self) -> bool {
        self.flags & ENTRY_FLAG_DELETED != 0
    }

    pub fn has_ecc(&self) -> bool {
        self.flags & ENTRY_FLAG_ECC != 0
    }

    /// Derive the tombstone that logically removes this content.
    ///
    /// Stamped strictly after the live entry, even when both happen within
    /// one second; a resurrection written later still overtakes it, since
    /// equal timestamps resolve in favor of the live entry.
    pub fn tombstone(&self, now: u32) -> IndexEntry {
        let mut entry = self.clone();
        entry.flags |= ENTRY_FLAG_DELETED;
        entry.timestamp = now.max(self.timestamp + 1);
        entry
    }
}

/// Pick the winner between two entries for the same id: later timestamp
/// wins, and on a timestamp tie the live entry beats the tombstone.
fn better<'a>(a: &'a IndexEntry, b: &'a IndexEntry) -> &'a IndexEntry {
    match a.timestamp.cmp(&b.timestamp) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            if a.is_deleted() {
                b
            } else {
                a
            }
        }
    }
}

/// One decoded index blob, entries sorted by id.
pub struct IndexBlobData {
    pub name: String,
    pub epoch: u32,
    entries: Vec<IndexEntry>,
}

impl IndexBlobData {
    pub fn new(name: String, epoch: u32, entries: Vec<IndexEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].id <= w[1].id));
        Self {
            name,
            epoch,
            entries,
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// All records for `id` (binary search, then widen).
    pub fn find(&self, id: &ContentId) -> &[IndexEntry] {
        let lo = self.entries.partition_point(|e| e.id < *id);
        let hi = self.entries.partition_point(|e| e.id <= *id);
        &self.entries[lo..hi]
    }
}

struct IndexGeneration {
    epoch: u32,
    blobs: Vec<IndexBlobData>,
}

/// Immutable union view over all loaded index blobs.
pub struct CombinedIndex {
    // newest epoch first
    generations: Vec<IndexGeneration>,
}

impl CombinedIndex {
    pub fn empty() -> Self {
        Self {
            generations: Vec::new(),
        }
    }

    pub fn new(mut blobs: Vec<IndexBlobData>) -> Self {
        blobs.sort_by(|a, b| b.epoch.cmp(&a.epoch));
        let mut generations: Vec<IndexGeneration> = Vec::new();
        for blob in blobs {
            match generations.last_mut() {
                Some(generation) if generation.epoch == blob.epoch => {
                    generation.blobs.push(blob)
                }
                _ => generations.push(IndexGeneration {
                    epoch: blob.epoch,
                    blobs: vec![blob],
                }),
            }
        }
        Self { generations }
    }

    pub fn blob_count(&self) -> usize {
        self.generations.iter().map(|g| g.blobs.len()).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.generations
            .iter()
            .flat_map(|g| &g.blobs)
            .map(|b| b.entries.len())
            .sum()
    }

    /// Effective state of an id, including tombstones. The newest epoch that
    /// knows the id decides.
    pub fn lookup_raw(&self, id: &ContentId) -> Option<&IndexEntry> {
        for generation in &self.generations {
            let mut best: Option<&IndexEntry> = None;
            for blob in &generation.blobs {
                for entry in blob.find(id) {
                    best = Some(match best {
                        Some(current) => better(current, entry),
                        None => entry,
                    });
                }
            }
            if best.is_some() {
                return best;
            }
        }
        None
    }

    /// Live-content lookup: tombstoned ids report as absent.
    pub fn lookup(&self, id: &ContentId) -> Option<&IndexEntry> {
        self.lookup_raw(id).filter(|entry| !entry.is_deleted())
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.lookup(id).is_some()
    }

    /// Merge everything into one effective entry per id, tombstones
    /// included. Maintenance (GC, compaction, verify) iterates this.
    pub fn effective_entries(&self) -> BTreeMap<ContentId, IndexEntry> {
        let mut merged: BTreeMap<ContentId, IndexEntry> = BTreeMap::new();
        // newest epoch first; older generations only fill in unknown ids
        for generation in &self.generations {
            let mut generation_view: BTreeMap<ContentId, &IndexEntry> = BTreeMap::new();
            for blob in &generation.blobs {
                for entry in &blob.entries {
                    generation_view
                        .entry(entry.id)
                        .and_modify(|current| *current = better(*current, entry))
                        .or_insert(entry);
                }
            }
            for (id, entry) in generation_view {
                merged.entry(id).or_insert_with(|| entry.clone());
            }
        }
        merged
    }

    /// Effective live entries of one category, in id order.
    pub fn iterate_prefix(&self, category: Category) -> Vec<IndexEntry> {
        self.effective_entries()
            .into_values()
            .filter(|entry| !entry.is_deleted() && entry.id.category() == category)
            .collect()
    }
}
