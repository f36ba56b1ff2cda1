//! Repository open/create and the maintenance entry points.
//!
//! The format blob is the only thing a client may read before it knows
//! anything else: a small plain JSON document at a well-known id holding the
//! repository identity, key derivation parameters, format version and the
//! algorithm/epoch configuration. Everything else is reached through the
//! [ContentManager] built from it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;

use packvault_api_types::{
    CacheTuning, EccConfig, EncryptionKind, EpochParameters, Fingerprint, HashKind, KdfKind,
    KeyDerivation, RepositoryFormat, RetentionMode, SplitterKind, DEFAULT_PACK_SIZE,
    FORMAT_BLOB_ID, FORMAT_VERSION,
};
use packvault_tools::backoff::Backoff;
use packvault_tools::time::epoch_i64;
use packvault_tools::Cancel;

use crate::backend::{with_retry, BlobStore, PutOptions};
use crate::cache::{BlobListCache, DiskCache, DiskCacheConfig};
use crate::content_id::ContentId;
use crate::content_store::{Caches, ContentManager, ContentManagerConfig};
use crate::crypt_config::CryptConfig;
use crate::error::{StoreError, StoreResult};
use crate::gc::{self, GcOptions};
use crate::index::upgrade::{cleanup_legacy, upgrade_v0};
use crate::index::EpochManager;
use crate::lock::{self, LockGuard, LockOptions};
use crate::manifest::{
    delete_snapshot_manifest, list_snapshot_manifests, read_snapshot_manifest, SnapshotManifest,
};

use packvault_api_types::GarbageCollectionStatus;

const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Options for creating a fresh repository.
pub struct CreateOptions {
    pub splitter: SplitterKind,
    pub hash: HashKind,
    pub encryption: EncryptionKind,
    pub max_pack_size: u32,
    pub epoch: EpochParameters,
    pub ecc: Option<EccConfig>,
    pub retention_mode: RetentionMode,
    pub retention_period_secs: Option<u64>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            splitter: SplitterKind::default(),
            hash: HashKind::default(),
            encryption: EncryptionKind::default(),
            max_pack_size: DEFAULT_PACK_SIZE,
            epoch: EpochParameters::default(),
            ecc: None,
            retention_mode: RetentionMode::None,
            retention_period_secs: None,
        }
    }
}

/// Options for opening an existing repository.
pub struct OpenOptions {
    /// Directory for the local content/metadata caches; no caching when
    /// unset.
    pub cache_root: Option<PathBuf>,
    pub cache: CacheTuning,
    pub backoff: Backoff,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache_root: None,
            cache: CacheTuning::default(),
            backoff: Backoff::default(),
        }
    }
}

pub struct Repository {
    store: Arc<dyn BlobStore>,
    format: RepositoryFormat,
    crypt: Arc<CryptConfig>,
    content: ContentManager,
    backoff: Backoff,
}

fn derive_master_key(passphrase: &[u8], kdf: &KeyDerivation) -> StoreResult<[u8; 32]> {
    let mut key = [0u8; 32];
    match kdf.algorithm {
        KdfKind::Pbkdf2Sha256 => {
            pbkdf2_hmac(
                passphrase,
                &kdf.salt,
                kdf.iterations as usize,
                MessageDigest::sha256(),
                &mut key,
            )
            .map_err(|err| StoreError::permanent(format!("key derivation failed - {}", err)))?;
        }
    }
    Ok(key)
}

fn read_format(store: &dyn BlobStore, backoff: &Backoff) -> StoreResult<RepositoryFormat> {
    let data = with_retry("read format blob", backoff, || {
        store.get(FORMAT_BLOB_ID, 0, None)
    })
    .map_err(|err| match err {
        StoreError::NotFound(_) => {
            StoreError::NotFound("no packvault repository at this location".into())
        }
        other => other,
    })?;
    let format: RepositoryFormat = serde_json::from_slice(&data)
        .map_err(|err| StoreError::Corrupted(format!("bad format blob - {}", err)))?;
    format
        .validate()
        .map_err(|err| StoreError::permanent(err.to_string()))?;
    Ok(format)
}

fn write_format(
    store: &dyn BlobStore,
    backoff: &Backoff,
    format: &RepositoryFormat,
    if_absent: bool,
) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(format)
        .map_err(|err| StoreError::permanent(format!("format encode failed - {}", err)))?;
    let opts = PutOptions {
        if_absent,
        retention: None,
    };
    with_retry("write format blob", backoff, || {
        store.put(FORMAT_BLOB_ID, &data, &opts)
    })
}

impl Repository {
    /// Initialize a repository in an empty backend and open it.
    pub fn create(
        store: Arc<dyn BlobStore>,
        opts: CreateOptions,
        passphrase: &[u8],
        open_opts: OpenOptions,
    ) -> StoreResult<Repository> {
        let mut unique_id = [0u8; 16];
        let mut salt = [0u8; 16];
        openssl::rand::rand_bytes(&mut unique_id)
            .and_then(|_| openssl::rand::rand_bytes(&mut salt))
            .map_err(|err| StoreError::permanent(format!("rng failure - {}", err)))?;

        let key_derivation = KeyDerivation {
            algorithm: KdfKind::Pbkdf2Sha256,
            salt: salt.to_vec(),
            iterations: DEFAULT_KDF_ITERATIONS,
        };
        let master_key = derive_master_key(passphrase, &key_derivation)?;
        let crypt = CryptConfig::new(master_key)
            .map_err(|err| StoreError::permanent(err.to_string()))?;

        let mut required_features = vec!["epoch-index".to_string()];
        if opts.ecc.is_some() {
            required_features.push("content-ecc".to_string());
        }

        let format = RepositoryFormat {
            unique_id: hex::encode(unique_id),
            format_version: FORMAT_VERSION,
            key_derivation,
            splitter: opts.splitter,
            hash: opts.hash,
            encryption: opts.encryption,
            max_pack_size: opts.max_pack_size,
            epoch: opts.epoch,
            ecc: opts.ecc,
            retention_mode: opts.retention_mode,
            retention_period_secs: opts.retention_period_secs,
            required_features,
            key_fingerprint: Some(crypt.fingerprint()),
        };
        format
            .validate()
            .map_err(|err| StoreError::permanent(err.to_string()))?;

        write_format(&*store, &open_opts.backoff, &format, true).map_err(|err| match err {
            StoreError::AlreadyExists(_) => {
                StoreError::AlreadyExists("repository already initialized".into())
            }
            other => other,
        })?;

        Self::open(store, passphrase, open_opts)
    }

    /// Open an existing repository.
    pub fn open(
        store: Arc<dyn BlobStore>,
        passphrase: &[u8],
        opts: OpenOptions,
    ) -> StoreResult<Repository> {
        let format = read_format(&*store, &opts.backoff)?;
        if format.format_version != FORMAT_VERSION {
            return Err(StoreError::Conflict(format!(
                "repository uses index format v{}, run the format upgrade first",
                format.format_version
            )));
        }

        let master_key = derive_master_key(passphrase, &format.key_derivation)?;
        let crypt = Arc::new(
            CryptConfig::new(master_key)
                .map_err(|err| StoreError::permanent(err.to_string()))?,
        );
        if let Some(expected) = &format.key_fingerprint {
            if crypt.fingerprint() != *expected {
                return Err(StoreError::permanent("wrong passphrase for repository"));
            }
        }

        let caches = match &opts.cache_root {
            Some(root) => Some(Arc::new(Caches {
                content: DiskCache::new(
                    root.join("contents"),
                    DiskCacheConfig {
                        soft_bytes: opts.cache.content_cache_soft_bytes,
                        hard_bytes: opts.cache.content_cache_hard_bytes,
                        min_sweep_age: Duration::from_secs(
                            opts.cache.content_cache_min_sweep_age_secs,
                        ),
                    },
                )
                .map_err(|err| StoreError::permanent(err.to_string()))?,
                metadata: DiskCache::new(
                    root.join("metadata"),
                    DiskCacheConfig {
                        soft_bytes: opts.cache.metadata_cache_soft_bytes,
                        hard_bytes: opts.cache.metadata_cache_hard_bytes,
                        min_sweep_age: Duration::from_secs(
                            opts.cache.metadata_cache_min_sweep_age_secs,
                        ),
                    },
                )
                .map_err(|err| StoreError::permanent(err.to_string()))?,
                blob_list: BlobListCache::new(Duration::from_secs(
                    opts.cache.blob_list_cache_ttl_secs,
                )),
            })),
            None => None,
        };

        let mut session = [0u8; 4];
        openssl::rand::rand_bytes(&mut session)
            .map_err(|err| StoreError::permanent(format!("rng failure - {}", err)))?;
        let epoch = Arc::new(EpochManager::new(
            store.clone(),
            format.epoch.clone(),
            &session,
            opts.backoff.clone(),
        ));

        let retention = match format.retention_mode {
            RetentionMode::None => None,
            mode => format
                .retention_period_secs
                .map(|period| (mode, period)),
        };

        let content = ContentManager::new(
            store.clone(),
            crypt.clone(),
            epoch,
            ContentManagerConfig {
                max_pack_size: format.max_pack_size,
                ecc: format.ecc,
                retention,
            },
            caches,
            opts.backoff.clone(),
        )?;

        Ok(Repository {
            store,
            format,
            crypt,
            content,
            backoff: opts.backoff,
        })
    }

    /// Migrate a v0 (flat index) repository to the epoch layout. Takes the
    /// write lock for the whole run and flips the format version only after
    /// the rewritten index validated; a failed validation leaves the lock in
    /// place for the operator.
    pub fn upgrade_format(
        store: Arc<dyn BlobStore>,
        owner: &str,
        lock_opts: &LockOptions,
        backoff: &Backoff,
    ) -> StoreResult<()> {
        let mut format = read_format(&*store, backoff)?;
        if format.format_version != 0 {
            return Err(StoreError::Conflict(format!(
                "repository is already at format v{}",
                format.format_version
            )));
        }

        let guard = lock::acquire(store.clone(), owner, lock_opts)?;

        let mut session = [0u8; 4];
        openssl::rand::rand_bytes(&mut session)
            .map_err(|err| StoreError::permanent(format!("rng failure - {}", err)))?;
        let epoch = EpochManager::new(
            store.clone(),
            format.epoch.clone(),
            &session,
            backoff.clone(),
        );

        let report = match upgrade_v0(&store, &epoch, backoff) {
            Ok(report) => report,
            Err(err) => {
                // never auto-commit on doubt: the lock stays in place until
                // an operator sorts it out
                log::error!("index upgrade failed, leaving repository locked - {}", err);
                std::mem::forget(guard);
                return Err(err);
            }
        };
        log::info!(
            "index upgrade: {} legacy blobs, {} entries -> {}",
            report.legacy_blobs,
            report.migrated_entries,
            report.checkpoint_blob
        );

        format.format_version = FORMAT_VERSION;
        if !format
            .required_features
            .iter()
            .any(|feature| feature == "epoch-index")
        {
            format.required_features.push("epoch-index".to_string());
        }
        write_format(&*store, backoff, &format, false)?;

        guard.release()
    }

    pub fn format(&self) -> &RepositoryFormat {
        &self.format
    }

    pub fn content(&self) -> &ContentManager {
        &self.content
    }

    pub fn crypt(&self) -> &CryptConfig {
        &self.crypt
    }

    pub fn key_fingerprint(&self) -> Fingerprint {
        self.crypt.fingerprint()
    }

    pub fn splitter(&self) -> SplitterKind {
        self.format.splitter
    }

    /// Seal and upload everything outstanding.
    pub fn flush(&self) -> StoreResult<()> {
        self.content.flush()
    }

    pub fn refresh(&self) -> StoreResult<()> {
        self.content.reload_index()
    }

    pub fn lock(&self, owner: &str, opts: &LockOptions) -> StoreResult<LockGuard> {
        lock::acquire(self.store.clone(), owner, opts)
    }

    // snapshot manifest surface

    pub fn snapshots(&self) -> StoreResult<Vec<(ContentId, SnapshotManifest)>> {
        list_snapshot_manifests(&self.content)
    }

    pub fn load_snapshot(&self, id: &ContentId) -> StoreResult<SnapshotManifest> {
        read_snapshot_manifest(&self.content, id)
    }

    pub fn delete_snapshot(&self, id: &ContentId) -> StoreResult<()> {
        delete_snapshot_manifest(&self.content, id, epoch_i64() as u32)
    }

    /// Mark-and-sweep over the manifest graph. Requires the write lock and
    /// refuses to run while the repository format is mid-upgrade.
    pub fn garbage_collect(
        &self,
        guard: &LockGuard,
        opts: &GcOptions,
        cancel: &Cancel,
    ) -> StoreResult<GarbageCollectionStatus> {
        let current = read_format(&*self.store, &self.backoff)?;
        if current.format_version != FORMAT_VERSION {
            return Err(StoreError::Conflict(
                "format upgrade in progress, refusing to collect garbage".into(),
            ));
        }
        gc::run(&self.content, guard, opts, cancel)
    }

    /// Routine index maintenance: drop superseded index blobs and leftover
    /// v0 blobs once their safety margins have passed.
    pub fn index_maintenance(&self, _guard: &LockGuard) -> StoreResult<usize> {
        let now = epoch_i64();
        let mut removed = self.content.epoch_manager().cleanup(now)?;
        removed += cleanup_legacy(
            &self.store,
            &self.backoff,
            now,
            self.format.epoch.cleanup_safety_margin_secs,
        )?;
        Ok(removed)
    }
}
