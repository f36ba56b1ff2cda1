//! End to end snapshot/restore scenarios against an in-memory backend.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use packvault_api_types::{
    EpochParameters, SnapshotStats, SplitterKind, UploaderTuning, MIN_PACK_SIZE,
};
use packvault_client::{
    restore_snapshot, DefaultPolicy, NullProgress, ProgressSink, Uploader,
};
use packvault_datastore::{
    BlobStore, Category, CreateOptions, GcOptions, LockOptions, MemoryStore, OpenOptions,
    Repository,
};
use packvault_tools::backoff::Backoff;
use packvault_tools::Cancel;

fn open_opts() -> OpenOptions {
    OpenOptions {
        cache_root: None,
        cache: Default::default(),
        backoff: Backoff::none(),
    }
}

fn create_repo(store: Arc<MemoryStore>) -> Arc<Repository> {
    let store: Arc<dyn BlobStore> = store;
    Arc::new(
        Repository::create(
            store,
            CreateOptions {
                splitter: SplitterKind::Buzhash1M,
                max_pack_size: MIN_PACK_SIZE,
                ..Default::default()
            },
            b"test passphrase",
            open_opts(),
        )
        .unwrap(),
    )
}

fn uploader(repo: &Arc<Repository>, tuning: UploaderTuning, cancel: Cancel) -> Uploader {
    uploader_with_progress(repo, tuning, cancel, Arc::new(NullProgress))
}

fn uploader_with_progress(
    repo: &Arc<Repository>,
    tuning: UploaderTuning,
    cancel: Cancel,
    progress: Arc<dyn ProgressSink>,
) -> Uploader {
    Uploader::new(
        repo.clone(),
        tuning,
        Arc::new(DefaultPolicy),
        progress,
        cancel,
        "tester".to_string(),
        "testhost".to_string(),
    )
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    let mut state = seed | 1;
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn assert_trees_equal(a: &Path, b: &Path) {
    let mut names_a: Vec<_> = fs::read_dir(a)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    let mut names_b: Vec<_> = fs::read_dir(b)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b, "directory listings differ at {:?}", a);

    for name in names_a {
        let path_a = a.join(&name);
        let path_b = b.join(&name);
        let meta_a = fs::symlink_metadata(&path_a).unwrap();
        if meta_a.is_dir() {
            assert_trees_equal(&path_a, &path_b);
        } else if meta_a.is_file() {
            assert_eq!(
                fs::read(&path_a).unwrap(),
                fs::read(&path_b).unwrap(),
                "file contents differ: {:?}",
                path_a
            );
        } else {
            assert_eq!(
                fs::read_link(&path_a).unwrap(),
                fs::read_link(&path_b).unwrap()
            );
        }
    }
}

/// Scenario: snapshot a small tree, restore it, byte-compare. "hello" is
/// stored once even though two files carry it.
#[test]
fn snapshot_and_restore_round_trip() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();
    fs::write(source.path().join("b.txt"), b"hello").unwrap();
    fs::write(source.path().join("c.bin"), pseudo_random(10 * 1024 * 1024, 42)).unwrap();
    fs::create_dir(source.path().join("sub")).unwrap();
    fs::write(source.path().join("sub/nested.txt"), b"nested").unwrap();
    std::os::unix::fs::symlink("a.txt", source.path().join("link")).unwrap();

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());

    let manifest = up.snapshot(source.path(), None).unwrap();
    assert!(manifest.is_complete());
    assert_eq!(manifest.stats.total_file_count, 4);
    assert_eq!(manifest.stats.hashed_files, 4);
    assert_eq!(manifest.stats.fatal_errors, 0);

    // both "hello" files map to one stored content
    let stats = repo.content().stats();
    assert!(stats.deduped_contents.load(Ordering::Relaxed) >= 1);

    // c.bin split into multiple contents
    let data_contents = repo
        .content()
        .index_snapshot()
        .iterate_prefix(Category::Data)
        .len();
    assert!(data_contents > 3, "expected several chunks, got {}", data_contents);

    let target = tempfile::tempdir().unwrap();
    let restored = restore_snapshot(
        &repo,
        &manifest,
        &target.path().join("out"),
        &Cancel::new(),
    )
    .unwrap();
    assert_eq!(restored.files, 4);
    assert_eq!(restored.symlinks, 1);
    assert_trees_equal(source.path(), &target.path().join("out"));
}

/// Scenario: the second snapshot of a mostly-unchanged tree reuses cached
/// object ids and uploads almost nothing.
#[test]
fn incremental_snapshot_reuses_unchanged_files() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();
    fs::write(source.path().join("b.txt"), b"hello").unwrap();
    fs::write(source.path().join("c.bin"), pseudo_random(4 * 1024 * 1024, 42)).unwrap();

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());

    let first = up.snapshot(source.path(), None).unwrap();
    let uploaded_before = repo
        .content()
        .stats()
        .uploaded_bytes
        .load(Ordering::Relaxed);

    // mtime has one-second granularity
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(source.path().join("b.txt"), b"world").unwrap();

    let second = up.snapshot(source.path(), Some(&first)).unwrap();
    assert_eq!(second.stats.cached_files, 2);
    assert_eq!(second.stats.hashed_files, 1);
    assert_eq!(second.stats.hashed_bytes, 5);

    // "hello" stays referenced through a.txt; only "world" plus manifest
    // overhead went out
    let uploaded_after = repo
        .content()
        .stats()
        .uploaded_bytes
        .load(Ordering::Relaxed);
    assert!(
        uploaded_after - uploaded_before < 64 * 1024,
        "second snapshot uploaded {} bytes",
        uploaded_after - uploaded_before
    );

    let target = tempfile::tempdir().unwrap();
    restore_snapshot(&repo, &second, &target.path().join("out"), &Cancel::new()).unwrap();
    assert_eq!(
        fs::read(target.path().join("out/b.txt")).unwrap(),
        b"world"
    );
}

/// Re-snapshotting an unchanged tree yields the same root object id, and
/// with ignore-identical-snapshots no new manifest is written.
#[test]
fn identical_snapshot_detection() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("stable.txt"), b"does not change").unwrap();

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);

    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
    let first = up.snapshot(source.path(), None).unwrap();

    let second = up.snapshot(source.path(), Some(&first)).unwrap();
    assert_eq!(second.root, first.root);
    assert_eq!(repo.snapshots().unwrap().len(), 2);

    let tuning = UploaderTuning {
        ignore_identical_snapshots: true,
        ..Default::default()
    };
    let up = uploader(&repo, tuning, Cancel::new());
    let third = up.snapshot(source.path(), Some(&second)).unwrap();
    assert_eq!(third.root, first.root);
    // no third manifest appeared
    assert_eq!(repo.snapshots().unwrap().len(), 2);
}

/// Scenario: dropping a snapshot and collecting garbage frees its unique
/// contents while shared ones survive; the remaining snapshot restores.
#[test]
fn gc_after_snapshot_deletion() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("a.txt"), b"hello").unwrap();
    fs::write(source.path().join("big.bin"), pseudo_random(3 * 1024 * 1024, 7)).unwrap();

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
    let first = up.snapshot(source.path(), None).unwrap();

    // second snapshot without the big file, with one new file
    std::thread::sleep(Duration::from_millis(1100));
    fs::remove_file(source.path().join("big.bin")).unwrap();
    fs::write(source.path().join("b.txt"), b"world").unwrap();
    let second = up.snapshot(source.path(), Some(&first)).unwrap();

    let entries_before = repo
        .content()
        .index_snapshot()
        .iterate_prefix(Category::Data)
        .len();

    // drop the first snapshot, collect with no age protection
    let (first_id, _) = repo
        .snapshots()
        .unwrap()
        .into_iter()
        .find(|(_, m)| m.start_time == first.start_time)
        .unwrap();
    repo.delete_snapshot(&first_id).unwrap();

    let lock_opts = LockOptions {
        io_drain_timeout: Duration::ZERO,
        ..Default::default()
    };
    let guard = repo.lock("gc-tester", &lock_opts).unwrap();
    let status = repo
        .garbage_collect(
            &guard,
            &GcOptions {
                min_content_age_secs: 0,
                pack_safety_margin_secs: 3600,
            },
            &Cancel::new(),
        )
        .unwrap();
    guard.release().unwrap();

    assert_eq!(status.snapshot_count, 1);
    assert!(status.tombstoned_contents > 0);

    let entries_after = repo
        .content()
        .index_snapshot()
        .iterate_prefix(Category::Data)
        .len();
    assert!(entries_after < entries_before);

    // the surviving snapshot still restores completely
    let target = tempfile::tempdir().unwrap();
    restore_snapshot(&repo, &second, &target.path().join("out"), &Cancel::new()).unwrap();
    assert_trees_equal(source.path(), &target.path().join("out"));

    // GC is idempotent
    let guard = repo.lock("gc-tester", &lock_opts).unwrap();
    let status = repo
        .garbage_collect(
            &guard,
            &GcOptions {
                min_content_age_secs: 0,
                pack_safety_margin_secs: 3600,
            },
            &Cancel::new(),
        )
        .unwrap();
    assert_eq!(status.tombstoned_contents, 0);
}

/// Scenario: epochs close and compact while snapshots keep flowing, and
/// every snapshot stays readable afterwards.
#[test]
fn epoch_compaction_under_load() {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
    let repo = Arc::new(
        Repository::create(
            store.clone(),
            CreateOptions {
                splitter: SplitterKind::Buzhash1M,
                max_pack_size: MIN_PACK_SIZE,
                epoch: EpochParameters {
                    advance_on_count: 3,
                    min_duration_secs: 1_000_000,
                    ..Default::default()
                },
                ..Default::default()
            },
            b"pass",
            open_opts(),
        )
        .unwrap(),
    );

    let source = tempfile::tempdir().unwrap();
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
    let mut manifests = Vec::new();
    for round in 0..7 {
        fs::write(
            source.path().join("data.txt"),
            format!("payload for round {}", round),
        )
        .unwrap();
        manifests.push(up.snapshot(source.path(), None).unwrap());
    }

    // at least one epoch closed and produced a compaction blob
    assert!(!store.list("e").unwrap().is_empty(), "no epoch marker appeared");
    let compacted = store
        .list("x")
        .unwrap()
        .into_iter()
        .filter(|m| m.id.contains("_compacted_") || m.id.contains("_checkpoint_"))
        .count();
    assert!(compacted >= 1, "no compaction blob appeared");

    // lookups stay identical after compaction
    repo.refresh().unwrap();
    for (round, manifest) in manifests.iter().enumerate() {
        let target = tempfile::tempdir().unwrap();
        restore_snapshot(&repo, manifest, &target.path().join("out"), &Cancel::new()).unwrap();
        assert_eq!(
            fs::read(target.path().join("out/data.txt")).unwrap(),
            format!("payload for round {}", round).into_bytes()
        );
    }
}

/// Empty files restore as empty files; a directory of identical files
/// stores its payload once.
#[test]
fn boundary_empty_and_identical_files() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("empty"), b"").unwrap();
    for i in 0..100 {
        fs::write(
            source.path().join(format!("copy_{:03}", i)),
            b"the same bytes in every file",
        )
        .unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
    let manifest = up.snapshot(source.path(), None).unwrap();
    assert_eq!(manifest.stats.total_file_count, 101);

    // one content for the shared payload, one for the empty file
    let data_contents = repo
        .content()
        .index_snapshot()
        .iterate_prefix(Category::Data)
        .len();
    assert_eq!(data_contents, 2);

    let target = tempfile::tempdir().unwrap();
    restore_snapshot(&repo, &manifest, &target.path().join("out"), &Cancel::new()).unwrap();
    assert_trees_equal(source.path(), &target.path().join("out"));
}

struct CancelAfterFiles {
    cancel: Cancel,
    files: u64,
}

impl ProgressSink for CancelAfterFiles {
    fn report(&self, stats: &SnapshotStats) {
        if stats.hashed_files >= self.files {
            self.cancel.cancel();
        }
    }
}

/// Scenario: cancel mid-upload, then snapshot again. Contents that made it
/// into sealed packs are reused, so the retry uploads only the remainder.
#[test]
fn cancelled_upload_resumes_cheaply() {
    let source = tempfile::tempdir().unwrap();
    for i in 0..3 {
        fs::write(
            source.path().join(format!("big_{}.bin", i)),
            pseudo_random(12 * 1024 * 1024, 1000 + i),
        )
        .unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let repo = create_repo(store);

    let cancel = Cancel::new();
    let sink = Arc::new(CancelAfterFiles {
        cancel: cancel.clone(),
        files: 2,
    });
    let up = uploader_with_progress(
        &repo,
        UploaderTuning {
            parallel_uploads: Some(1),
            ..Default::default()
        },
        cancel,
        sink,
    );
    let interrupted = up.snapshot(source.path(), None).unwrap();
    assert!(!interrupted.is_complete());
    assert_eq!(interrupted.incomplete.as_deref(), Some("cancelled"));

    let uploaded_before = repo
        .content()
        .stats()
        .uploaded_bytes
        .load(Ordering::Relaxed);
    assert!(uploaded_before > 0, "nothing was uploaded before the cancel");

    // fresh attempt, no cancellation
    let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
    let complete = up.snapshot(source.path(), None).unwrap();
    assert!(complete.is_complete());

    let uploaded_after = repo
        .content()
        .stats()
        .uploaded_bytes
        .load(Ordering::Relaxed);
    let retry_bytes = uploaded_after - uploaded_before;
    assert!(
        retry_bytes < 20 * 1024 * 1024,
        "retry re-uploaded {} bytes",
        retry_bytes
    );

    let target = tempfile::tempdir().unwrap();
    restore_snapshot(&repo, &complete, &target.path().join("out"), &Cancel::new()).unwrap();
    assert_trees_equal(source.path(), &target.path().join("out"));
}

/// The whole cycle also works against the filesystem backend, across a
/// close and reopen.
#[test]
fn filesystem_backend_persists() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("doc.txt"), b"persistent payload").unwrap();

    let backend_dir = tempfile::tempdir().unwrap();
    let manifest = {
        let store: Arc<dyn BlobStore> = Arc::new(
            packvault_datastore::FilesystemStore::create(backend_dir.path()).unwrap(),
        );
        let repo = Arc::new(
            Repository::create(
                store,
                CreateOptions {
                    splitter: SplitterKind::Buzhash1M,
                    max_pack_size: MIN_PACK_SIZE,
                    ..Default::default()
                },
                b"disk pass",
                open_opts(),
            )
            .unwrap(),
        );
        let up = uploader(&repo, UploaderTuning::default(), Cancel::new());
        up.snapshot(source.path(), None).unwrap()
    };

    // reopen from disk with the same passphrase
    let store: Arc<dyn BlobStore> =
        Arc::new(packvault_datastore::FilesystemStore::open(backend_dir.path()).unwrap());
    let repo = Repository::open(store, b"disk pass", open_opts()).unwrap();
    let snapshots = repo.snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].1.root, manifest.root);

    let target = tempfile::tempdir().unwrap();
    restore_snapshot(
        &repo,
        &snapshots[0].1,
        &target.path().join("out"),
        &Cancel::new(),
    )
    .unwrap();
    assert_trees_equal(source.path(), &target.path().join("out"));
}
