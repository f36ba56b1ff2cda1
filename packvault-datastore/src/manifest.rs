//! Snapshot and directory manifests.
//!
//! A directory manifest is the JSON body of a metadata *object* (so large
//! directories chunk and dedup like any file). A snapshot manifest is small
//! and stored directly as a single `m`-category content, which makes
//! enumerating snapshots an index-prefix scan instead of a backend walk.

use serde::{Deserialize, Serialize};

use packvault_api_types::SnapshotStats;

use crate::content_id::{Category, ContentId};
use crate::content_store::ContentManager;
use crate::error::{StoreError, StoreResult};
use crate::object::ObjectId;

use packvault_api_types::CompressionKind;

pub const MANIFEST_TYPE_SNAPSHOT: &str = "snapshot";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotManifest {
    #[serde(rename = "type")]
    pub manifest_type: String,
    pub username: String,
    pub hostname: String,
    pub path: String,
    pub root: ObjectId,
    pub start_time: i64,
    pub end_time: i64,
    pub stats: SnapshotStats,
    /// Present iff the snapshot did not complete; holds the reason
    /// ("cancelled", "checkpoint", an error description).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention_reasons: Vec<String>,
}

impl SnapshotManifest {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One directory entry. `object` is set for files and directories; symlinks
/// carry their target instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirSummary {
    pub total_bytes: u64,
    pub file_count: u64,
    pub dir_count: u64,
    pub ignored_errors: u64,
}

impl DirSummary {
    pub fn absorb(&mut self, other: &DirSummary) {
        self.total_bytes += other.total_bytes;
        self.file_count += other.file_count;
        self.dir_count += other.dir_count;
        self.ignored_errors += other.ignored_errors;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirManifest {
    /// Sorted by name.
    pub entries: Vec<DirEntry>,
    pub summary: DirSummary,
}

impl DirManifest {
    pub fn new(mut entries: Vec<DirEntry>, summary: DirSummary) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries, summary }
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| StoreError::permanent(format!("manifest encode failed - {}", err)))
    }

    pub fn from_bytes(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data)
            .map_err(|err| StoreError::Corrupted(format!("bad directory manifest - {}", err)))
    }

    pub fn lookup(&self, name: &str) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

/// Store a snapshot manifest as an `m` content.
pub fn write_snapshot_manifest(
    cm: &ContentManager,
    manifest: &SnapshotManifest,
) -> StoreResult<ContentId> {
    let data = serde_json::to_vec(manifest)
        .map_err(|err| StoreError::permanent(format!("manifest encode failed - {}", err)))?;
    cm.write_content(Category::Manifest, &data, CompressionKind::Zstd)
}

pub fn read_snapshot_manifest(
    cm: &ContentManager,
    id: &ContentId,
) -> StoreResult<SnapshotManifest> {
    let data = cm.read_content(id)?;
    let manifest: SnapshotManifest = serde_json::from_slice(&data)
        .map_err(|err| StoreError::Corrupted(format!("bad snapshot manifest - {}", err)))?;
    if manifest.manifest_type != MANIFEST_TYPE_SNAPSHOT {
        return Err(StoreError::Corrupted(format!(
            "content {} is not a snapshot manifest",
            id
        )));
    }
    Ok(manifest)
}

/// All live snapshot manifests, oldest first.
pub fn list_snapshot_manifests(
    cm: &ContentManager,
) -> StoreResult<Vec<(ContentId, SnapshotManifest)>> {
    let index = cm.index_snapshot();
    let mut snapshots = Vec::new();
    for entry in index.iterate_prefix(Category::Manifest) {
        match read_snapshot_manifest(cm, &entry.id) {
            Ok(manifest) => snapshots.push((entry.id, manifest)),
            // tolerate foreign manifest flavors sharing the prefix
            Err(StoreError::Corrupted(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    snapshots.sort_by_key(|(_, manifest)| manifest.start_time);
    Ok(snapshots)
}

/// Retention drops a snapshot by tombstoning its manifest content; the data
/// it referenced becomes garbage for the next GC run.
pub fn delete_snapshot_manifest(
    cm: &ContentManager,
    id: &ContentId,
    now: u32,
) -> StoreResult<()> {
    let tombstoned = cm.tombstone_contents(&[*id], now)?;
    if tombstoned.is_empty() {
        return Err(StoreError::NotFound(format!("snapshot manifest {}", id)));
    }
    Ok(())
}
