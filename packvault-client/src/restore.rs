//! Restore a snapshot tree to the local filesystem.

use std::fs::{File, Permissions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::{TimeSpec, TimeValLike};

use packvault_datastore::error::check_cancelled;
use packvault_datastore::object::read_object;
use packvault_datastore::{
    DirManifest, EntryKind, ObjectId, ObjectReader, Repository, SnapshotManifest, StoreError,
    StoreResult,
};
use packvault_tools::Cancel;

#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Materialize a snapshot into `target` (created if missing, must be empty
/// or absent).
pub fn restore_snapshot(
    repo: &Repository,
    manifest: &SnapshotManifest,
    target: &Path,
    cancel: &Cancel,
) -> StoreResult<RestoreStats> {
    if target.exists() {
        let mut entries = std::fs::read_dir(target)?;
        if entries.next().is_some() {
            return Err(StoreError::permanent(format!(
                "restore target {:?} is not empty",
                target
            )));
        }
    } else {
        std::fs::create_dir_all(target)?;
    }

    let mut stats = RestoreStats::default();
    restore_dir(repo, &manifest.root, target, cancel, &mut stats)?;
    Ok(stats)
}

fn restore_dir(
    repo: &Repository,
    oid: &ObjectId,
    target: &Path,
    cancel: &Cancel,
    stats: &mut RestoreStats,
) -> StoreResult<()> {
    check_cancelled(cancel)?;
    let manifest = DirManifest::from_bytes(&read_object(repo.content(), oid)?)?;

    for entry in &manifest.entries {
        check_cancelled(cancel)?;
        let path = target.join(&entry.name);
        match entry.kind {
            EntryKind::Dir => {
                std::fs::create_dir(&path)?;
                match &entry.object {
                    Some(child) => restore_dir(repo, child, &path, cancel, stats)?,
                    None => {
                        return Err(StoreError::Corrupted(format!(
                            "directory entry '{}' has no object id",
                            entry.name
                        )))
                    }
                }
                stats.dirs += 1;
                // after the children, so their creation cannot bump it
                apply_metadata(&path, entry.mode, entry.mtime)?;
            }
            EntryKind::File => {
                let object = entry.object.as_ref().ok_or_else(|| {
                    StoreError::Corrupted(format!(
                        "file entry '{}' has no object id",
                        entry.name
                    ))
                })?;
                let mut reader = ObjectReader::new(repo.content(), object)?;
                let file = File::create(&path)?;
                let mut writer = BufWriter::new(file);
                let copied = std::io::copy(&mut reader, &mut writer).map_err(|err| {
                    StoreError::Corrupted(format!("restore of '{}' failed - {}", entry.name, err))
                })?;
                writer.flush()?;
                drop(writer);
                if copied != entry.size {
                    return Err(StoreError::Corrupted(format!(
                        "file '{}' restored {} of {} bytes",
                        entry.name, copied, entry.size
                    )));
                }
                stats.files += 1;
                stats.bytes += copied;
                apply_metadata(&path, entry.mode, entry.mtime)?;
            }
            EntryKind::Symlink => {
                let link_target = entry.target.as_ref().ok_or_else(|| {
                    StoreError::Corrupted(format!(
                        "symlink entry '{}' has no target",
                        entry.name
                    ))
                })?;
                std::os::unix::fs::symlink(link_target, &path)?;
                stats.symlinks += 1;
            }
        }
    }
    Ok(())
}

fn apply_metadata(path: &Path, mode: u32, mtime: i64) -> StoreResult<()> {
    std::fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?;
    let time = TimeSpec::seconds(mtime);
    utimensat(None, path, &time, &time, UtimensatFlags::NoFollowSymlink)
        .map_err(|err| StoreError::permanent(format!("utimensat on {:?} failed - {}", path, err)))
}
