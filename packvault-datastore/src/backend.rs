//! Blob backend interface and the two built-in adapters.
//!
//! The storage core only ever talks to a [BlobStore]: a content addressed,
//! opaque object store with put/get/list/delete. Cloud adapters (S3, GCS,
//! B2, WebDAV, SFTP) implement this trait externally; the crate ships a
//! local filesystem adapter and an in-memory adapter used heavily by tests.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use packvault_api_types::RetentionMode;
use packvault_tools::backoff::{self, Backoff};
use packvault_tools::time::{epoch_i64, system_time_to_epoch};

use crate::error::{StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMeta {
    pub id: String,
    pub length: u64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Fail with [StoreError::AlreadyExists] instead of overwriting. Used
    /// for lock blobs and epoch markers, where losing the race must be
    /// observable.
    pub if_absent: bool,
    /// Optional retention protection for the written blob.
    pub retention: Option<(RetentionMode, u64)>,
}

impl PutOptions {
    pub fn if_absent() -> Self {
        Self {
            if_absent: true,
            retention: None,
        }
    }
}

/// A shared, thread safe blob backend.
///
/// Blob ids are short printable names; the repository layer controls the
/// naming scheme. Implementations must tolerate concurrent callers.
pub trait BlobStore: Send + Sync {
    fn name(&self) -> String;

    fn put(&self, id: &str, data: &[u8], opts: &PutOptions) -> StoreResult<()>;

    /// Read `length` bytes starting at `offset`; `None` reads to the end.
    fn get(&self, id: &str, offset: u64, length: Option<u64>) -> StoreResult<Vec<u8>>;

    fn get_metadata(&self, id: &str) -> StoreResult<BlobMeta>;

    /// List blobs whose id starts with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> StoreResult<Vec<BlobMeta>>;

    fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Run a backend operation under the repository retry schedule. Only
/// transient errors retry; an exhausted budget reports as permanent.
pub fn with_retry<T>(
    desc: &str,
    backoff: &Backoff,
    op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    backoff::retry(desc, backoff, StoreError::is_retriable, op)
        .map_err(StoreError::into_permanent)
}

struct MemoryBlob {
    data: Vec<u8>,
    timestamp: i64,
    retained_until: Option<i64>,
}

/// In-memory backend. Complete semantics including retention, so the
/// maintenance paths can be tested without a cloud account.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, MemoryBlob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: flip bytes inside a stored blob.
    pub fn corrupt(&self, id: &str, offset: usize, mask: u8) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        blob.data[offset] ^= mask;
        Ok(())
    }

    /// Test hook: backdate a blob so age-gated maintenance paths trigger.
    pub fn backdate(&self, id: &str, seconds: i64) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        blob.timestamp -= seconds;
        Ok(())
    }
}

impl BlobStore for MemoryStore {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn put(&self, id: &str, data: &[u8], opts: &PutOptions) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        if opts.if_absent && blobs.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let now = epoch_i64();
        let retained_until = match &opts.retention {
            Some((RetentionMode::None, _)) | None => None,
            Some((_, period)) => Some(now + *period as i64),
        };
        blobs.insert(
            id.to_string(),
            MemoryBlob {
                data: data.to_vec(),
                timestamp: now,
                retained_until,
            },
        );
        Ok(())
    }

    fn get(&self, id: &str, offset: u64, length: Option<u64>) -> StoreResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let start = offset as usize;
        if start > blob.data.len() {
            return Err(StoreError::permanent(format!(
                "read past end of blob {}",
                id
            )));
        }
        let end = match length {
            Some(length) => (start + length as usize).min(blob.data.len()),
            None => blob.data.len(),
        };
        Ok(blob.data[start..end].to_vec())
    }

    fn get_metadata(&self, id: &str) -> StoreResult<BlobMeta> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(BlobMeta {
            id: id.to_string(),
            length: blob.data.len() as u64,
            timestamp: blob.timestamp,
        })
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<BlobMeta>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, blob)| BlobMeta {
                id: id.clone(),
                length: blob.data.len() as u64,
                timestamp: blob.timestamp,
            })
            .collect())
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.get(id) {
            None => return Err(StoreError::NotFound(id.to_string())),
            Some(blob) => {
                if let Some(until) = blob.retained_until {
                    if epoch_i64() < until {
                        return Err(StoreError::RetentionProtected(id.to_string()));
                    }
                }
            }
        }
        blobs.remove(id);
        Ok(())
    }
}

/// Local filesystem backend: one file per blob, flat under the root
/// directory. Writes go to a temporary sibling first and are renamed into
/// place, so concurrent readers never see partial blobs.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn create<P: Into<PathBuf>>(root: P) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn open<P: Into<PathBuf>>(root: P) -> StoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::NotFound(format!(
                "blob store root {:?} does not exist",
                root
            )));
        }
        Ok(Self { root })
    }

    fn blob_path(&self, id: &str) -> StoreResult<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(StoreError::permanent(format!("invalid blob id '{}'", id)));
        }
        Ok(self.root.join(id))
    }
}

impl BlobStore for FilesystemStore {
    fn name(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    fn put(&self, id: &str, data: &[u8], opts: &PutOptions) -> StoreResult<()> {
        let path = self.blob_path(id)?;
        if opts.if_absent {
            // create_new gives the atomic existence check; lock blobs and
            // markers are tiny, so the non-staged write is fine here
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(StoreError::AlreadyExists(id.to_string()));
                }
                Err(err) => return Err(err.into()),
            };
            file.write_all(data)?;
            file.sync_all()?;
            return Ok(());
        }
        packvault_tools::fs::replace_file(&path, data)
            .map_err(|err| StoreError::transient(format!("write of blob {} failed - {}", id, err)))
    }

    fn get(&self, id: &str, offset: u64, length: Option<u64>) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(id)?;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        match length {
            Some(length) => {
                let mut data = vec![0u8; length as usize];
                file.read_exact(&mut data).map_err(|err| {
                    if err.kind() == ErrorKind::UnexpectedEof {
                        StoreError::Corrupted(format!(
                            "blob {} shorter than indexed range", id
                        ))
                    } else {
                        err.into()
                    }
                })?;
                Ok(data)
            }
            None => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    fn get_metadata(&self, id: &str) -> StoreResult<BlobMeta> {
        let path = self.blob_path(id)?;
        let meta = std::fs::metadata(&path)?;
        Ok(BlobMeta {
            id: id.to_string(),
            length: meta.len(),
            timestamp: meta
                .modified()
                .map(system_time_to_epoch)
                .unwrap_or_else(|_| epoch_i64()),
        })
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<BlobMeta>> {
        let mut blobs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            // skip in-flight temporaries
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            blobs.push(BlobMeta {
                id: name,
                length: meta.len(),
                timestamp: meta
                    .modified()
                    .map(system_time_to_epoch)
                    .unwrap_or_else(|_| epoch_i64()),
            });
        }
        Ok(blobs)
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let path = self.blob_path(id)?;
        std::fs::remove_file(&path).map_err(StoreError::from)
    }
}
