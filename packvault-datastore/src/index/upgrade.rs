//! One-shot migration from the legacy v0 flat index to the epoch layout.
//!
//! v0 repositories carry `n*` index blobs with no epoch grouping. The
//! migration merges every v0 entry, writes the result as a checkpoint blob
//! at epoch 0, validates the written blob entry by entry against the merged
//! input, and only then may the caller flip the format version. On any
//! doubt the migration aborts and leaves the repository locked for operator
//! attention; it never auto-commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use packvault_tools::backoff::Backoff;

use crate::backend::{with_retry, BlobStore};
use crate::content_id::ContentId;
use crate::error::{StoreError, StoreResult};
use crate::index::epoch::EpochManager;
use crate::index::format::decode_index_blob;
use crate::index::IndexEntry;

pub struct UpgradeReport {
    pub legacy_blobs: usize,
    pub migrated_entries: usize,
    pub checkpoint_blob: String,
}

/// Rewrite all v0 index blobs into a single epoch-0 checkpoint blob.
///
/// The caller must hold the repository write lock and flips the format blob
/// version only after this returns successfully. Legacy blobs are left in
/// place; [cleanup_legacy] removes them once the safety margin has passed.
pub fn upgrade_v0(
    store: &Arc<dyn BlobStore>,
    epoch: &EpochManager,
    backoff: &Backoff,
) -> StoreResult<UpgradeReport> {
    let legacy = with_retry("list legacy index blobs", backoff, || store.list("n"))?;
    if legacy.is_empty() {
        return Err(StoreError::Conflict(
            "no legacy index blobs found, nothing to upgrade".into(),
        ));
    }

    let mut merged: BTreeMap<ContentId, IndexEntry> = BTreeMap::new();
    for meta in &legacy {
        let data = with_retry("read legacy index blob", backoff, || {
            store.get(&meta.id, 0, None)
        })?;
        let (_, entries) = decode_index_blob(&data)?;
        for entry in entries {
            merged
                .entry(entry.id)
                .and_modify(|current| {
                    if entry.timestamp > current.timestamp {
                        *current = entry.clone();
                    }
                })
                .or_insert(entry);
        }
    }

    let checkpoint_blob = epoch.write_checkpoint_from_entries(
        0,
        merged.values().cloned().collect(),
    )?;

    // validate entry by entry before anyone flips the version
    let written = with_retry("re-read migrated index", backoff, || {
        store.get(&checkpoint_blob, 0, None)
    })?;
    let (_, mut written_entries) = decode_index_blob(&written)?;
    written_entries.sort_by(|a, b| a.id.cmp(&b.id));
    if written_entries.len() != merged.len() {
        return Err(StoreError::Corrupted(format!(
            "index migration mismatch: {} entries in, {} out",
            merged.len(),
            written_entries.len()
        )));
    }
    for (written, (_, expected)) in written_entries.iter().zip(merged.iter()) {
        if written != expected {
            return Err(StoreError::Corrupted(format!(
                "index migration mismatch at content {}",
                expected.id
            )));
        }
    }

    Ok(UpgradeReport {
        legacy_blobs: legacy.len(),
        migrated_entries: merged.len(),
        checkpoint_blob,
    })
}

/// Remove legacy v0 blobs once the repository runs on the v1 index and the
/// cleanup margin has passed.
pub fn cleanup_legacy(
    store: &Arc<dyn BlobStore>,
    backoff: &Backoff,
    now: i64,
    margin_secs: u64,
) -> StoreResult<usize> {
    let legacy = with_retry("list legacy index blobs", backoff, || store.list("n"))?;
    let mut deleted = 0;
    for meta in legacy {
        if now - meta.timestamp < margin_secs as i64 {
            continue;
        }
        match store.delete(&meta.id) {
            Ok(()) | Err(StoreError::NotFound(_)) => deleted += 1,
            Err(err) => return Err(err),
        }
    }
    Ok(deleted)
}
