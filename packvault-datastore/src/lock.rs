//! Repository write lock.
//!
//! A timed, advisory lock blob in the backend. It serializes the
//! format-changing operations (upgrade, GC, certain compactions); regular
//! snapshot writers do not take it. Acquisition is a create-if-absent put,
//! so exactly one owner wins; stale locks are broken after their expiry plus
//! the permitted clock drift. After winning, the owner waits out the
//! configured I/O drain window so in-flight writers of the previous owner
//! can finish.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use packvault_tools::time::epoch_i64;

use crate::backend::{BlobStore, PutOptions};
use crate::error::{StoreError, StoreResult};

pub const LOCK_BLOB_ID: &str = "packvault.lock";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockBlob {
    pub owner: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

#[derive(Clone, Debug)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Grace period for in-flight I/O of other writers after acquisition.
    pub io_drain_timeout: Duration,
    pub max_permitted_clock_drift: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            io_drain_timeout: Duration::from_secs(30),
            max_permitted_clock_drift: Duration::from_secs(300),
        }
    }
}

/// Proof of lock ownership. Dropping releases best-effort; explicit
/// [LockGuard::release] reports errors.
pub struct LockGuard {
    store: Arc<dyn BlobStore>,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn release(mut self) -> StoreResult<()> {
        self.released = true;
        release_owned(&*self.store, &self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = release_owned(&*self.store, &self.owner) {
                log::warn!("lock release failed - {}", err);
            }
        }
    }
}

fn release_owned(store: &dyn BlobStore, owner: &str) -> StoreResult<()> {
    let current = read_lock(store)?;
    match current {
        Some(blob) if blob.owner == owner => store.delete(LOCK_BLOB_ID),
        Some(blob) => Err(StoreError::Conflict(format!(
            "lock is now held by '{}'",
            blob.owner
        ))),
        None => Ok(()),
    }
}

/// Read the current lock blob, if any.
pub fn read_lock(store: &dyn BlobStore) -> StoreResult<Option<LockBlob>> {
    match store.get(LOCK_BLOB_ID, 0, None) {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| StoreError::Corrupted(format!("bad lock blob - {}", err))),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Acquire the repository write lock for `owner`.
pub fn acquire(
    store: Arc<dyn BlobStore>,
    owner: &str,
    opts: &LockOptions,
) -> StoreResult<LockGuard> {
    let mut broke_stale = false;
    loop {
        let now = epoch_i64();
        let blob = LockBlob {
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + opts.ttl.as_secs() as i64,
        };
        let body = serde_json::to_vec(&blob)
            .map_err(|err| StoreError::permanent(format!("lock encode failed - {}", err)))?;

        match store.put(LOCK_BLOB_ID, &body, &PutOptions::if_absent()) {
            Ok(()) => {
                if !opts.io_drain_timeout.is_zero() {
                    std::thread::sleep(opts.io_drain_timeout);
                }
                return Ok(LockGuard {
                    store,
                    owner: owner.to_string(),
                    released: false,
                });
            }
            Err(StoreError::AlreadyExists(_)) => {
                let held = read_lock(&*store)?;
                let stale = match &held {
                    Some(held) => {
                        now > held.expires_at + opts.max_permitted_clock_drift.as_secs() as i64
                    }
                    None => true, // raced with a release
                };
                if !stale {
                    let holder = held.map(|blob| blob.owner).unwrap_or_default();
                    return Err(StoreError::Conflict(format!(
                        "repository is locked by '{}'",
                        holder
                    )));
                }
                if broke_stale {
                    return Err(StoreError::Conflict(
                        "repository lock keeps reappearing".into(),
                    ));
                }
                log::warn!("breaking stale repository lock");
                match store.delete(LOCK_BLOB_ID) {
                    Ok(()) | Err(StoreError::NotFound(_)) => (),
                    Err(err) => return Err(err),
                }
                broke_stale = true;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;

    fn fast_opts() -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(60),
            io_drain_timeout: Duration::ZERO,
            max_permitted_clock_drift: Duration::from_secs(1),
        }
    }

    #[test]
    fn exclusive_acquisition() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let guard = acquire(store.clone(), "writer-a", &fast_opts()).unwrap();

        match acquire(store.clone(), "writer-b", &fast_opts()) {
            Err(StoreError::Conflict(msg)) => assert!(msg.contains("writer-a")),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }

        guard.release().unwrap();
        let guard = acquire(store.clone(), "writer-b", &fast_opts()).unwrap();
        drop(guard);
        assert!(read_lock(&*store).unwrap().is_none());
    }

    #[test]
    fn stale_lock_is_broken() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let expired = LockBlob {
            owner: "dead-writer".into(),
            acquired_at: epoch_i64() - 7200,
            expires_at: epoch_i64() - 3600,
        };
        store
            .put(
                LOCK_BLOB_ID,
                &serde_json::to_vec(&expired).unwrap(),
                &PutOptions::default(),
            )
            .unwrap();

        let guard = acquire(store.clone(), "writer-a", &fast_opts()).unwrap();
        assert_eq!(read_lock(&*store).unwrap().unwrap().owner, "writer-a");
        drop(guard);
    }

    #[test]
    fn foreign_release_is_refused() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let _guard = acquire(store.clone(), "writer-a", &fast_opts()).unwrap();

        // simulate a confused process trying to free someone else's lock
        match release_owned(&*store, "writer-b") {
            Err(StoreError::Conflict(_)) => (),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
