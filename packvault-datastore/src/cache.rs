//! Local caches.
//!
//! Two independent on-disk caches hold encrypted content sections fetched
//! from pack blobs: one for data contents, one for metadata/manifest
//! contents (different size limits and sweep ages). Entries are written
//! through on read. The layout is a directory per leading digest byte, so
//! sweeps never scan one huge directory.
//!
//! Listing the backend is expensive, so blob listings are additionally
//! cached in memory with a short TTL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use packvault_tools::fs::{create_path, read_optional_file, replace_file};
use packvault_tools::time::{epoch_i64, system_time_to_epoch};

use crate::backend::BlobMeta;
use crate::content_id::ContentId;

#[derive(Clone, Debug)]
pub struct DiskCacheConfig {
    pub soft_bytes: u64,
    pub hard_bytes: u64,
    pub min_sweep_age: Duration,
}

/// Bounded on-disk cache keyed by content id.
pub struct DiskCache {
    root: PathBuf,
    config: DiskCacheConfig,
    // approximate; corrected on every sweep
    usage: Mutex<u64>,
}

impl DiskCache {
    pub fn new<P: Into<PathBuf>>(root: P, config: DiskCacheConfig) -> Result<Self, anyhow::Error> {
        let root = root.into();
        create_path(&root)?;
        let cache = Self {
            root,
            config,
            usage: Mutex::new(0),
        };
        *cache.usage.lock().unwrap() = cache.scan_usage()?;
        Ok(cache)
    }

    fn entry_path(&self, id: &ContentId) -> PathBuf {
        let text = id.to_string();
        // shard by the first digest byte; ids of non-data categories start
        // with their prefix character, which lands them in their own shards
        let shard = &text[..2];
        self.root.join(shard).join(text)
    }

    pub fn get(&self, id: &ContentId) -> Option<Vec<u8>> {
        match read_optional_file(self.entry_path(id)) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("cache read for {} failed - {}", id, err);
                None
            }
        }
    }

    /// Store an entry; silently skipped when over the hard limit even after
    /// sweeping. Cache failures never fail the read path.
    pub fn put(&self, id: &ContentId, data: &[u8]) {
        let projected = {
            let usage = self.usage.lock().unwrap();
            *usage + data.len() as u64
        };
        if projected > self.config.soft_bytes {
            if let Err(err) = self.sweep() {
                log::warn!("cache sweep failed - {}", err);
            }
            if *self.usage.lock().unwrap() + data.len() as u64 > self.config.hard_bytes {
                return;
            }
        }

        let path = self.entry_path(id);
        if let Some(parent) = path.parent() {
            if create_path(parent).is_err() {
                return;
            }
        }
        match replace_file(&path, data) {
            Ok(()) => {
                *self.usage.lock().unwrap() += data.len() as u64;
            }
            Err(err) => log::warn!("cache write for {} failed - {}", id, err),
        }
    }

    fn scan_entries(&self) -> Result<Vec<(PathBuf, u64, i64)>, anyhow::Error> {
        let mut entries = Vec::new();
        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path())? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let mtime = meta
                    .modified()
                    .map(system_time_to_epoch)
                    .unwrap_or_else(|_| epoch_i64());
                entries.push((entry.path(), meta.len(), mtime));
            }
        }
        Ok(entries)
    }

    fn scan_usage(&self) -> Result<u64, anyhow::Error> {
        Ok(self.scan_entries()?.iter().map(|(_, len, _)| len).sum())
    }

    /// Evict oldest-first down to the soft limit, but never touch entries
    /// younger than the minimum sweep age.
    pub fn sweep(&self) -> Result<(), anyhow::Error> {
        let mut entries = self.scan_entries()?;
        let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum();
        entries.sort_by_key(|(_, _, mtime)| *mtime);

        let now = epoch_i64();
        let min_age = self.config.min_sweep_age.as_secs() as i64;
        for (path, len, mtime) in entries {
            if total <= self.config.soft_bytes {
                break;
            }
            if now - mtime < min_age {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => total -= len,
                Err(err) => log::warn!("cache eviction of {:?} failed - {}", path, err),
            }
        }
        *self.usage.lock().unwrap() = total;
        Ok(())
    }

    pub fn usage(&self) -> u64 {
        *self.usage.lock().unwrap()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// In-memory cache of backend listings with a short TTL.
pub struct BlobListCache {
    ttl: Duration,
    listings: Mutex<HashMap<String, (Instant, Vec<BlobMeta>)>>,
}

impl BlobListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            listings: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, prefix: &str) -> Option<Vec<BlobMeta>> {
        let listings = self.listings.lock().unwrap();
        let (cached_at, listing) = listings.get(prefix)?;
        if cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(listing.clone())
    }

    pub fn put(&self, prefix: &str, listing: Vec<BlobMeta>) {
        self.listings
            .lock()
            .unwrap()
            .insert(prefix.to_string(), (Instant::now(), listing));
    }

    /// Drop cached listings; called after writes that change the namespace.
    pub fn invalidate(&self) {
        self.listings.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::Category;

    fn id(fill: u8) -> ContentId {
        ContentId::new(Category::Data, [fill; 32])
    }

    fn small_cache(dir: &Path, soft: u64, hard: u64, min_age: Duration) -> DiskCache {
        DiskCache::new(
            dir,
            DiskCacheConfig {
                soft_bytes: soft,
                hard_bytes: hard,
                min_sweep_age: min_age,
            },
        )
        .unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 1 << 20, 2 << 20, Duration::ZERO);

        assert!(cache.get(&id(1)).is_none());
        cache.put(&id(1), b"encrypted bytes");
        assert_eq!(cache.get(&id(1)).unwrap(), b"encrypted bytes");
        assert_eq!(cache.usage(), 15);
    }

    #[test]
    fn usage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = small_cache(dir.path(), 1 << 20, 2 << 20, Duration::ZERO);
            cache.put(&id(1), &[0u8; 100]);
            cache.put(&id(2), &[0u8; 50]);
        }
        let cache = small_cache(dir.path(), 1 << 20, 2 << 20, Duration::ZERO);
        assert_eq!(cache.usage(), 150);
    }

    #[test]
    fn sweep_evicts_down_to_soft_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 300, 1000, Duration::ZERO);
        for fill in 0..10u8 {
            cache.put(&id(fill), &[fill; 100]);
        }
        cache.sweep().unwrap();
        assert!(cache.usage() <= 300);
        // the newest entries survive
        let survivors = (0..10u8).filter(|fill| cache.get(&id(*fill)).is_some()).count();
        assert!(survivors >= 2);
    }

    #[test]
    fn sweep_respects_min_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 100, 10_000, Duration::from_secs(3600));
        for fill in 0..5u8 {
            cache.put(&id(fill), &[fill; 100]);
        }
        cache.sweep().unwrap();
        // everything is younger than the age floor
        for fill in 0..5u8 {
            assert!(cache.get(&id(fill)).is_some());
        }
    }

    #[test]
    fn blob_list_cache_expires() {
        let cache = BlobListCache::new(Duration::from_millis(20));
        assert!(cache.get("p").is_none());
        cache.put(
            "p",
            vec![BlobMeta {
                id: "p123".into(),
                length: 10,
                timestamp: 0,
            }],
        );
        assert_eq!(cache.get("p").unwrap().len(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("p").is_none());

        cache.put("p", Vec::new());
        cache.invalidate();
        assert!(cache.get("p").is_none());
    }
}
