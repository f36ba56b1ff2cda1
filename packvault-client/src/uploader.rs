//! Snapshot upload orchestration.
//!
//! One traversal thread walks the tree in name order and composes directory
//! manifests; file hashing runs on a bounded pool of worker threads feeding
//! the shared content manager. Counters are atomics, cancellation is a
//! token checked between entries, and periodic checkpoints flush all open
//! packs and record an incomplete snapshot manifest so an interrupted run
//! seeds the next one.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Sender};

use packvault_api_types::{SplitterKind, UploaderTuning};
use packvault_datastore::error::check_cancelled;
use packvault_datastore::manifest::{
    delete_snapshot_manifest, write_snapshot_manifest, MANIFEST_TYPE_SNAPSHOT,
};
use packvault_datastore::object::read_object;
use packvault_datastore::{
    Category, ContentId, DirEntry, DirManifest, DirSummary, EntryKind, ObjectId, ObjectWriter,
    Repository, SnapshotManifest, StoreError, StoreResult,
};
use packvault_tools::time::epoch_i64;
use packvault_tools::Cancel;

use crate::policy::{EntryErrorKind, ErrorAction, UploadPolicy};
use crate::progress::{ProgressSink, UploadCounters};

const READ_BUFFER_SIZE: usize = 512 * 1024;
/// Checkpoints must come often enough for a 45 minute resume window.
const MAX_CHECKPOINT_INTERVAL_SECS: u64 = 44 * 60;

pub struct Uploader {
    repo: Arc<Repository>,
    tuning: UploaderTuning,
    policy: Arc<dyn UploadPolicy>,
    progress: Arc<dyn ProgressSink>,
    cancel: Cancel,
    username: String,
    hostname: String,
}

struct FileJob {
    abs: PathBuf,
    rel: PathBuf,
    template: DirEntry,
    results: Sender<(DirEntry, StoreResult<ObjectId>)>,
}

struct Frame {
    name: String,
    entries: Vec<DirEntry>,
    summary: DirSummary,
}

struct Ctx<'c> {
    jobs: Sender<FileJob>,
    previous: HashMap<PathBuf, DirEntry>,
    frames: Vec<Frame>,
    checkpoint_manifests: Vec<ContentId>,
    last_checkpoint_time: i64,
    last_checkpoint_bytes: u64,
    counters: &'c UploadCounters,
    source_path: String,
    start_time: i64,
}

impl Uploader {
    pub fn new(
        repo: Arc<Repository>,
        tuning: UploaderTuning,
        policy: Arc<dyn UploadPolicy>,
        progress: Arc<dyn ProgressSink>,
        cancel: Cancel,
        username: String,
        hostname: String,
    ) -> Self {
        Self {
            repo,
            tuning,
            policy,
            progress,
            cancel,
            username,
            hostname,
        }
    }

    pub fn cancel_token(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Create one snapshot of `root`. Returns the written manifest; on
    /// cancellation the manifest is marked incomplete instead of failing.
    pub fn snapshot(
        &self,
        root: &Path,
        previous: Option<&SnapshotManifest>,
    ) -> StoreResult<SnapshotManifest> {
        let start_time = epoch_i64();
        let counters = UploadCounters::default();
        let wall_start = Instant::now();

        let previous_entries = match previous {
            Some(manifest) => match load_previous_tree(&self.repo, &manifest.root) {
                Ok(map) => map,
                Err(err) => {
                    log::warn!("previous manifest unusable for change detection - {}", err);
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let parallelism = self.tuning.parallel_uploads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        let (jobs_tx, jobs_rx) = bounded::<FileJob>(parallelism * 2);

        let splitter = self.repo.splitter();
        let (outcome, checkpoint_manifests) = std::thread::scope(|scope| {
            for _ in 0..parallelism {
                let jobs_rx = jobs_rx.clone();
                let counters = &counters;
                scope.spawn(move || {
                    while let Ok(job) = jobs_rx.recv() {
                        let result = self.hash_file(splitter, &job, counters, wall_start);
                        self.progress.report(&counters.snapshot());
                        let _ = job.results.send((job.template, result));
                    }
                });
            }

            let mut ctx = Ctx {
                jobs: jobs_tx,
                previous: previous_entries,
                frames: Vec::new(),
                checkpoint_manifests: Vec::new(),
                last_checkpoint_time: start_time,
                last_checkpoint_bytes: 0,
                counters: &counters,
                source_path: root.display().to_string(),
                start_time,
            };
            let outcome = self.upload_dir(&mut ctx, root, Path::new(""));
            drop(ctx.jobs);
            (outcome, ctx.checkpoint_manifests)
        });

        let manifest = match outcome {
            Ok((root_oid, _summary)) => {
                if self.tuning.ignore_identical_snapshots {
                    if let Some(prev) = previous {
                        if prev.is_complete() && prev.root == root_oid {
                            log::info!("snapshot identical to previous, skipping manifest");
                            self.cleanup_checkpoints(&checkpoint_manifests);
                            return Ok(prev.clone());
                        }
                    }
                }
                self.repo.flush()?;
                self.finish_manifest(root, root_oid, &counters, start_time, None)?
            }
            Err(StoreError::Cancelled) => {
                log::warn!("upload cancelled, recording incomplete snapshot");
                // sealed packs complete; buffered ones are dropped whole
                self.repo.content().discard_open_packs();
                self.repo.flush()?;
                let root_oid = self.partial_root_from_previous(previous)?;
                self.finish_manifest(
                    root,
                    root_oid,
                    &counters,
                    start_time,
                    Some("cancelled".to_string()),
                )?
            }
            Err(err) => {
                self.repo.content().discard_open_packs();
                return Err(err);
            }
        };

        self.cleanup_checkpoints(&checkpoint_manifests);
        self.progress.report(&manifest.stats);
        Ok(manifest)
    }

    /// Root object for a cancelled run's manifest: reuse the previous root
    /// when there is one (the cached contents make the next attempt cheap),
    /// otherwise record an empty directory.
    fn partial_root_from_previous(
        &self,
        previous: Option<&SnapshotManifest>,
    ) -> StoreResult<ObjectId> {
        if let Some(prev) = previous {
            return Ok(prev.root);
        }
        let manifest = DirManifest::new(Vec::new(), DirSummary::default());
        self.write_dir_manifest(&manifest)
    }

    fn finish_manifest(
        &self,
        root: &Path,
        root_oid: ObjectId,
        counters: &UploadCounters,
        start_time: i64,
        incomplete: Option<String>,
    ) -> StoreResult<SnapshotManifest> {
        let manifest = SnapshotManifest {
            manifest_type: MANIFEST_TYPE_SNAPSHOT.to_string(),
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            path: root.display().to_string(),
            root: root_oid,
            start_time,
            end_time: epoch_i64(),
            stats: counters.snapshot(),
            incomplete,
            tags: Vec::new(),
            retention_reasons: Vec::new(),
        };
        write_snapshot_manifest(self.repo.content(), &manifest)?;
        self.repo.flush()?;
        Ok(manifest)
    }

    fn cleanup_checkpoints(&self, manifests: &[ContentId]) {
        let now = epoch_i64() as u32;
        for id in manifests {
            if let Err(err) = delete_snapshot_manifest(self.repo.content(), id, now) {
                log::warn!("checkpoint manifest cleanup failed - {}", err);
            }
        }
    }

    fn write_dir_manifest(&self, manifest: &DirManifest) -> StoreResult<ObjectId> {
        let mut writer = ObjectWriter::new(
            self.repo.content(),
            self.repo.splitter(),
            Category::Metadata,
            packvault_api_types::CompressionKind::Zstd,
        );
        writer.write(&manifest.to_bytes()?)?;
        writer.finish()
    }

    fn upload_dir(
        &self,
        ctx: &mut Ctx,
        abs: &Path,
        rel: &Path,
    ) -> StoreResult<(ObjectId, DirSummary)> {
        check_cancelled(&self.cancel)?;

        let mut dir_entries: Vec<std::fs::DirEntry> = match std::fs::read_dir(abs) {
            Ok(iter) => match iter.collect::<Result<Vec<_>, _>>() {
                Ok(entries) => entries,
                Err(err) => return Err(StoreError::from(err)),
            },
            Err(err) => return Err(StoreError::from(err)),
        };
        dir_entries.sort_by_key(|entry| entry.file_name());

        let frame_name = rel
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        ctx.frames.push(Frame {
            name: frame_name,
            entries: Vec::new(),
            summary: DirSummary::default(),
        });

        let (results_tx, results_rx) = unbounded();

        let result: StoreResult<()> = (|| {
            for fs_entry in dir_entries {
                check_cancelled(&self.cancel)?;
                self.maybe_checkpoint(ctx)?;

                let name = fs_entry.file_name().to_string_lossy().into_owned();
                let entry_rel = rel.join(&name);
                let file_type = match fs_entry.file_type() {
                    Ok(file_type) => file_type,
                    Err(err) => {
                        self.handle_entry_error(ctx, EntryErrorKind::FileRead, &entry_rel, &err.into())?;
                        continue;
                    }
                };
                if self.policy.excludes(&entry_rel, file_type.is_dir()) {
                    continue;
                }
                let meta = match fs_entry.metadata() {
                    Ok(meta) => meta,
                    Err(err) => {
                        self.handle_entry_error(ctx, EntryErrorKind::FileRead, &entry_rel, &err.into())?;
                        continue;
                    }
                };

                if file_type.is_symlink() {
                    let target = match std::fs::read_link(fs_entry.path()) {
                        Ok(target) => target.to_string_lossy().into_owned(),
                        Err(err) => {
                            self.handle_entry_error(
                                ctx,
                                EntryErrorKind::FileRead,
                                &entry_rel,
                                &err.into(),
                            )?;
                            continue;
                        }
                    };
                    let frame = ctx.frames.last_mut().unwrap();
                    frame.entries.push(DirEntry {
                        name,
                        kind: EntryKind::Symlink,
                        mode: meta.mode(),
                        size: 0,
                        mtime: meta.mtime(),
                        uid: meta.uid(),
                        gid: meta.gid(),
                        object: None,
                        target: Some(target),
                    });
                } else if file_type.is_dir() {
                    match self.upload_dir(ctx, &fs_entry.path(), &entry_rel) {
                        Ok((child_oid, child_summary)) => {
                            ctx.counters.add(&ctx.counters.total_dirs, 1);
                            let frame = ctx.frames.last_mut().unwrap();
                            frame.summary.absorb(&child_summary);
                            frame.summary.dir_count += 1;
                            frame.entries.push(DirEntry {
                                name,
                                kind: EntryKind::Dir,
                                mode: meta.mode(),
                                size: 0,
                                mtime: meta.mtime(),
                                uid: meta.uid(),
                                gid: meta.gid(),
                                object: Some(child_oid),
                                target: None,
                            });
                        }
                        Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                        Err(err) if self.tuning.fail_fast => return Err(err),
                        Err(err) => {
                            // the subtree is gone from this snapshot
                            log::warn!("skipping directory {:?} - {}", entry_rel, err);
                            ctx.counters.add(&ctx.counters.fatal_errors, 1);
                        }
                    }
                } else if file_type.is_file() {
                    self.process_file(ctx, fs_entry.path(), entry_rel, name, &meta, &results_tx)?;
                } else {
                    // sockets, fifos, devices
                    match self.policy.on_error(EntryErrorKind::UnknownType) {
                        ErrorAction::Ignore => {
                            ctx.counters.add(&ctx.counters.ignored_errors, 1);
                            ctx.frames.last_mut().unwrap().summary.ignored_errors += 1;
                        }
                        ErrorAction::Fatal => {
                            return Err(StoreError::permanent(format!(
                                "unsupported entry type at {:?}",
                                entry_rel
                            )))
                        }
                    }
                }
            }
            Ok(())
        })();
        drop(results_tx);

        // collect hashed files even if the loop failed, so worker sends
        // never hit a closed channel unnoticed
        let mut collected: StoreResult<()> = Ok(());
        for (template, file_result) in results_rx.iter() {
            match file_result {
                Ok(oid) => {
                    let frame = ctx.frames.last_mut().unwrap();
                    frame.summary.file_count += 1;
                    frame.summary.total_bytes += template.size;
                    let mut entry = template;
                    entry.object = Some(oid);
                    frame.entries.push(entry);
                }
                Err(StoreError::Cancelled) => {
                    if collected.is_ok() {
                        collected = Err(StoreError::Cancelled);
                    }
                }
                Err(err) => match self.policy.on_error(EntryErrorKind::FileRead) {
                    ErrorAction::Ignore => {
                        log::warn!("ignoring unreadable file {} - {}", template.name, err);
                        ctx.counters.add(&ctx.counters.ignored_errors, 1);
                        ctx.frames.last_mut().unwrap().summary.ignored_errors += 1;
                    }
                    ErrorAction::Fatal => {
                        if collected.is_ok() {
                            collected = Err(err);
                        }
                    }
                },
            }
        }

        result?;
        collected?;

        let frame = ctx.frames.pop().unwrap();
        let summary = frame.summary;
        let manifest = DirManifest::new(frame.entries, summary);
        let oid = self.write_dir_manifest(&manifest)?;
        Ok((oid, summary))
    }

    fn process_file(
        &self,
        ctx: &mut Ctx,
        abs: PathBuf,
        rel: PathBuf,
        name: String,
        meta: &std::fs::Metadata,
        results: &Sender<(DirEntry, StoreResult<ObjectId>)>,
    ) -> StoreResult<()> {
        ctx.counters.add(&ctx.counters.total_files, 1);
        ctx.counters.add(&ctx.counters.total_bytes, meta.len());

        let template = DirEntry {
            name,
            kind: EntryKind::File,
            mode: meta.mode(),
            size: meta.len(),
            mtime: meta.mtime(),
            uid: meta.uid(),
            gid: meta.gid(),
            object: None,
            target: None,
        };

        // unchanged files reuse the previous object id without re-reading
        if let Some(prev) = ctx.previous.get(&rel) {
            let unchanged = prev.kind == EntryKind::File
                && prev.size == template.size
                && prev.mtime == template.mtime
                && prev.mode == template.mode
                && prev.uid == template.uid
                && prev.object.is_some();
            if unchanged && !self.force_hash(&rel) {
                ctx.counters.add(&ctx.counters.cached_files, 1);
                ctx.counters.add(&ctx.counters.cached_bytes, template.size);
                let frame = ctx.frames.last_mut().unwrap();
                frame.summary.file_count += 1;
                frame.summary.total_bytes += template.size;
                let mut entry = template;
                entry.object = prev.object;
                frame.entries.push(entry);
                return Ok(());
            }
        }

        ctx.jobs
            .send(FileJob {
                abs,
                rel,
                template,
                results: results.clone(),
            })
            .map_err(|_| StoreError::permanent("upload worker pool shut down"))
    }

    fn force_hash(&self, rel: &Path) -> bool {
        let percent = self.tuning.force_hash_percent.min(100);
        if percent == 0 {
            return false;
        }
        crc32fast::hash(rel.as_os_str().as_bytes()) % 100 < percent as u32
    }

    fn hash_file(
        &self,
        splitter: SplitterKind,
        job: &FileJob,
        counters: &UploadCounters,
        wall_start: Instant,
    ) -> StoreResult<ObjectId> {
        let mut file = File::open(&job.abs)?;
        let mut writer = ObjectWriter::new(
            self.repo.content(),
            splitter,
            Category::Data,
            self.policy.compression(&job.rel),
        );
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            check_cancelled(&self.cancel)?;
            let count = file.read(&mut buf)?;
            if count == 0 {
                break;
            }
            writer.write(&buf[..count])?;
            counters.add(&counters.hashed_bytes, count as u64);
            self.throttle(counters, wall_start);
        }
        let oid = writer.finish()?;
        counters.add(&counters.hashed_files, 1);
        Ok(oid)
    }

    /// Crude bandwidth cap: hold hashing back so the long-run average stays
    /// below the configured limit.
    fn throttle(&self, counters: &UploadCounters, wall_start: Instant) {
        let limit = match self.tuning.upload_limit {
            Some(limit) if limit > 0 => limit,
            _ => return,
        };
        let hashed = counters.snapshot().hashed_bytes;
        let budget_secs = hashed as f64 / limit as f64;
        let elapsed = wall_start.elapsed().as_secs_f64();
        if budget_secs > elapsed {
            std::thread::sleep(std::time::Duration::from_secs_f64(
                (budget_secs - elapsed).min(1.0),
            ));
        }
    }

    fn handle_entry_error(
        &self,
        ctx: &mut Ctx,
        kind: EntryErrorKind,
        rel: &Path,
        err: &StoreError,
    ) -> StoreResult<()> {
        match self.policy.on_error(kind) {
            ErrorAction::Ignore => {
                log::warn!("ignoring error at {:?} - {}", rel, err);
                ctx.counters.add(&ctx.counters.ignored_errors, 1);
                ctx.frames.last_mut().unwrap().summary.ignored_errors += 1;
                Ok(())
            }
            ErrorAction::Fatal => Err(StoreError::permanent(format!(
                "fatal error at {:?} - {}",
                rel, err
            ))),
        }
    }

    /// Flush open packs and write an incomplete manifest covering the tree
    /// built so far, when the checkpoint interval or byte budget is due.
    fn maybe_checkpoint(&self, ctx: &mut Ctx) -> StoreResult<()> {
        let now = epoch_i64();
        let interval = self
            .tuning
            .checkpoint_interval_secs
            .min(MAX_CHECKPOINT_INTERVAL_SECS);
        let hashed = ctx.counters.snapshot().hashed_bytes;
        let time_due = now - ctx.last_checkpoint_time >= interval as i64;
        let bytes_due = hashed - ctx.last_checkpoint_bytes >= self.tuning.checkpoint_bytes;
        if !time_due && !bytes_due {
            return Ok(());
        }
        ctx.last_checkpoint_time = now;
        ctx.last_checkpoint_bytes = hashed;

        self.repo.flush()?;

        // wrap the partially built directory stack, leaf to root
        let mut child: Option<DirEntry> = None;
        let mut root_oid = None;
        for frame in ctx.frames.iter().rev() {
            let mut entries = frame.entries.clone();
            if let Some(child) = child.take() {
                entries.push(child);
            }
            let manifest = DirManifest::new(entries, frame.summary);
            let oid = self.write_dir_manifest(&manifest)?;
            root_oid = Some(oid);
            child = Some(DirEntry {
                name: frame.name.clone(),
                kind: EntryKind::Dir,
                mode: 0o755,
                size: 0,
                mtime: now,
                uid: 0,
                gid: 0,
                object: Some(oid),
                target: None,
            });
        }
        let root_oid = match root_oid {
            Some(oid) => oid,
            None => return Ok(()),
        };

        let manifest = SnapshotManifest {
            manifest_type: MANIFEST_TYPE_SNAPSHOT.to_string(),
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            path: ctx.source_path.clone(),
            root: root_oid,
            start_time: ctx.start_time,
            end_time: now,
            stats: ctx.counters.snapshot(),
            incomplete: Some("checkpoint".to_string()),
            tags: Vec::new(),
            retention_reasons: Vec::new(),
        };
        let id = write_snapshot_manifest(self.repo.content(), &manifest)?;
        self.repo.flush()?;
        ctx.checkpoint_manifests.push(id);
        log::info!("checkpoint written ({} bytes hashed so far)", hashed);
        Ok(())
    }
}

/// Flatten a previous snapshot's tree into `relative path -> entry` for
/// change detection.
fn load_previous_tree(
    repo: &Repository,
    root: &ObjectId,
) -> StoreResult<HashMap<PathBuf, DirEntry>> {
    let mut map = HashMap::new();
    walk_previous(repo, root, Path::new(""), &mut map)?;
    Ok(map)
}

fn walk_previous(
    repo: &Repository,
    oid: &ObjectId,
    prefix: &Path,
    map: &mut HashMap<PathBuf, DirEntry>,
) -> StoreResult<()> {
    let manifest = DirManifest::from_bytes(&read_object(repo.content(), oid)?)?;
    for entry in manifest.entries {
        let path = prefix.join(&entry.name);
        match entry.kind {
            EntryKind::Dir => {
                if let Some(child) = entry.object.as_ref() {
                    let child = *child;
                    walk_previous(repo, &child, &path, map)?;
                }
            }
            EntryKind::File => {
                map.insert(path, entry);
            }
            EntryKind::Symlink => (),
        }
    }
    Ok(())
}

/// Newest snapshot manifest recorded for a source path, used to seed
/// change detection and resumption.
pub fn latest_snapshot_for_path(
    repo: &Repository,
    path: &Path,
) -> StoreResult<Option<(ContentId, SnapshotManifest)>> {
    let wanted = path.display().to_string();
    let mut best: Option<(ContentId, SnapshotManifest)> = None;
    for (id, manifest) in repo.snapshots()? {
        if manifest.path != wanted {
            continue;
        }
        let newer = match &best {
            Some((_, current)) => manifest.start_time >= current.start_time,
            None => true,
        };
        if newer {
            best = Some((id, manifest));
        }
    }
    Ok(best)
}
