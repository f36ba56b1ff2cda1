//! Live upload progress.
//!
//! Worker threads bump the shared atomic counters; the uploader pushes a
//! consistent snapshot into the [ProgressSink] after every finished entry.
//! The sink is supplied by the embedding application (CLI, server); the
//! defaults here either drop the updates or rate-limit them into the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use packvault_api_types::SnapshotStats;

#[derive(Default)]
pub struct UploadCounters {
    pub total_files: AtomicU64,
    pub total_dirs: AtomicU64,
    pub total_bytes: AtomicU64,
    pub cached_files: AtomicU64,
    pub cached_bytes: AtomicU64,
    pub hashed_files: AtomicU64,
    pub hashed_bytes: AtomicU64,
    pub ignored_errors: AtomicU64,
    pub fatal_errors: AtomicU64,
}

impl UploadCounters {
    pub fn snapshot(&self) -> SnapshotStats {
        SnapshotStats {
            total_file_count: self.total_files.load(Ordering::Relaxed),
            total_dir_count: self.total_dirs.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            cached_files: self.cached_files.load(Ordering::Relaxed),
            cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
            hashed_files: self.hashed_files.load(Ordering::Relaxed),
            hashed_bytes: self.hashed_bytes.load(Ordering::Relaxed),
            ignored_errors: self.ignored_errors.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }

    pub fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, stats: &SnapshotStats);
}

/// Discards all updates.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _stats: &SnapshotStats) {}
}

/// Logs a progress line at most every few seconds.
pub struct LogProgress {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl LogProgress {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, stats: &SnapshotStats) {
        let mut last = self.last.lock().unwrap();
        if matches!(*last, Some(at) if at.elapsed() < self.interval) {
            return;
        }
        *last = Some(Instant::now());
        log::info!(
            "uploaded {} files ({} cached), {} bytes hashed, {} errors ignored",
            stats.hashed_files + stats.cached_files,
            stats.cached_files,
            stats.hashed_bytes,
            stats.ignored_errors,
        );
    }
}
