//! Garbage collection: two-phase mark and sweep over the manifest graph.
//!
//! Phase one loads every live snapshot manifest and walks its directory
//! tree, collecting the reachable content ids (chunks, object lists,
//! directory manifests, snapshot manifests). Phase two tombstones every
//! unreachable index entry older than the minimum content age, then deletes
//! pack blobs whose contents are all tombstoned once they outlive the
//! safety margin.
//!
//! The caller must hold the repository write lock; requiring a [LockGuard]
//! makes that a type-level fact. GC only emits tombstones with `now`, so a
//! concurrent resurrection with a later timestamp always wins.

use std::collections::HashSet;

use packvault_api_types::GarbageCollectionStatus;
use packvault_tools::time::epoch_i64;
use packvault_tools::Cancel;

use crate::content_id::ContentId;
use crate::content_store::ContentManager;
use crate::error::{check_cancelled, StoreResult};
use crate::lock::LockGuard;
use crate::manifest::{list_snapshot_manifests, DirManifest, EntryKind};
use crate::object::{object_content_ids, read_object, ObjectId};
use crate::pack::PackClass;

#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Never tombstone contents younger than this; protects in-flight
    /// writers whose index blobs have not landed yet.
    pub min_content_age_secs: u64,
    /// Packs must be this old before deletion.
    pub pack_safety_margin_secs: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            min_content_age_secs: 24 * 3600,
            pack_safety_margin_secs: 23 * 3600,
        }
    }
}

/// Walk one directory object, marking everything it references.
fn mark_dir(
    cm: &ContentManager,
    oid: &ObjectId,
    reachable: &mut HashSet<ContentId>,
    cancel: &Cancel,
) -> StoreResult<()> {
    check_cancelled(cancel)?;

    for id in object_content_ids(cm, oid)? {
        reachable.insert(id);
    }

    let manifest = DirManifest::from_bytes(&read_object(cm, oid)?)?;
    for entry in &manifest.entries {
        check_cancelled(cancel)?;
        match entry.kind {
            EntryKind::Dir => {
                if let Some(child) = &entry.object {
                    mark_dir(cm, child, reachable, cancel)?;
                }
            }
            EntryKind::File => {
                if let Some(child) = &entry.object {
                    for id in object_content_ids(cm, child)? {
                        reachable.insert(id);
                    }
                }
            }
            EntryKind::Symlink => (),
        }
    }
    Ok(())
}

/// Run a full mark-and-sweep pass. Repeated runs are idempotent: already
/// tombstoned entries are skipped, already deleted packs stay deleted.
pub fn run(
    cm: &ContentManager,
    _lock: &LockGuard,
    opts: &GcOptions,
    cancel: &Cancel,
) -> StoreResult<GarbageCollectionStatus> {
    let mut status = GarbageCollectionStatus::default();
    let now = epoch_i64();

    // phase 1: mark
    log::info!("gc: mark phase");
    cm.reload_index()?;
    let mut reachable: HashSet<ContentId> = HashSet::new();
    let snapshots = list_snapshot_manifests(cm)?;
    status.snapshot_count = snapshots.len();
    for (manifest_id, manifest) in &snapshots {
        check_cancelled(cancel)?;
        reachable.insert(*manifest_id);
        if manifest.root.is_indirect() || manifest.root.content_id().category().is_metadata() {
            mark_dir(cm, &manifest.root, &mut reachable, cancel)?;
        }
    }
    status.marked_contents = reachable.len();

    // phase 2a: tombstone unreachable contents
    log::info!("gc: sweep phase");
    let index = cm.index_snapshot();
    let mut to_tombstone = Vec::new();
    for (id, entry) in index.effective_entries() {
        check_cancelled(cancel)?;
        if entry.is_deleted() {
            continue;
        }
        if reachable.contains(&id) {
            status.marked_bytes += entry.original_length as u64;
            continue;
        }
        if now - (entry.timestamp as i64) < opts.min_content_age_secs as i64 {
            continue;
        }
        status.tombstoned_bytes += entry.original_length as u64;
        to_tombstone.push(id);
    }
    let tombstoned = cm.tombstone_contents(&to_tombstone, now as u32)?;
    status.tombstoned_contents = tombstoned.len();

    // phase 2b: delete packs with no live references
    let index = cm.index_snapshot();
    let mut live_packs: HashSet<String> = HashSet::new();
    let mut known_packs: HashSet<String> = HashSet::new();
    for (_, entry) in index.effective_entries() {
        let name = entry.pack_id.to_string();
        known_packs.insert(name.clone());
        if !entry.is_deleted() {
            live_packs.insert(name);
        }
    }

    for class in [PackClass::Data, PackClass::Metadata] {
        for meta in cm.list_packs(class)? {
            check_cancelled(cancel)?;
            if live_packs.contains(&meta.id) {
                continue;
            }
            if now - meta.timestamp < opts.pack_safety_margin_secs as i64 {
                continue;
            }
            // either fully tombstoned, or a stray from a long-dead session
            // that never produced index entries
            if !known_packs.contains(&meta.id) {
                log::info!("gc: deleting stray pack {}", meta.id);
            }
            cm.delete_pack(&meta.id)?;
            status.deleted_packs += 1;
            status.deleted_pack_bytes += meta.length;
        }
    }

    log::info!(
        "gc: {} snapshots, {} reachable contents, {} tombstoned, {} packs deleted",
        status.snapshot_count,
        status.marked_contents,
        status.tombstoned_contents,
        status.deleted_packs,
    );
    Ok(status)
}
