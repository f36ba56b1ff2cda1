//! Configuration and status types shared across the packvault crates.
//!
//! Everything here is plain serde data: the repository format blob, the
//! tuning knobs recognized in it, and the status structures reported by
//! long-running operations. No I/O happens in this crate.

use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

pub mod upload;

pub use upload::{SnapshotStats, UploaderTuning};

/// Well-known blob id of the repository format blob.
pub const FORMAT_BLOB_ID: &str = "packvault.repository";

/// Current repository format version. Version 0 repositories use a flat,
/// epoch-less index and must be upgraded before use.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptMode {
    /// Content is stored in plain (still content-addressed)
    None,
    /// Content is encrypted with the repository master key
    Encrypt,
}

/// Key fingerprint, used to detect mismatched master keys early.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(with = "hex::serde")]
    bytes: [u8; 32],
}

impl Fingerprint {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Display as short key ID (first 8 bytes, colon separated).
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text: Vec<String> = self.bytes[0..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        write!(f, "{}", text.join(":"))
    }
}

/// Content splitter algorithm.
///
/// Buzhash variants allow chunk sizes between `avg/4` and `avg*4`, fixed
/// variants always cut at the configured size.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SplitterKind {
    #[serde(rename = "FIXED-1M")]
    Fixed1M,
    #[serde(rename = "FIXED-4M")]
    Fixed4M,
    #[serde(rename = "BUZHASH-1M")]
    Buzhash1M,
    #[serde(rename = "BUZHASH-2M")]
    Buzhash2M,
    #[serde(rename = "BUZHASH-4M")]
    Buzhash4M,
    #[serde(rename = "BUZHASH-8M")]
    Buzhash8M,
}

serde_plain::derive_display_from_serialize!(SplitterKind);
serde_plain::derive_fromstr_from_deserialize!(SplitterKind);

impl SplitterKind {
    /// Average (fixed: exact) chunk size in bytes.
    pub fn avg_size(&self) -> usize {
        match self {
            SplitterKind::Fixed1M | SplitterKind::Buzhash1M => 1024 * 1024,
            SplitterKind::Buzhash2M => 2 * 1024 * 1024,
            SplitterKind::Fixed4M | SplitterKind::Buzhash4M => 4 * 1024 * 1024,
            SplitterKind::Buzhash8M => 8 * 1024 * 1024,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, SplitterKind::Fixed1M | SplitterKind::Fixed4M)
    }
}

impl Default for SplitterKind {
    fn default() -> Self {
        SplitterKind::Buzhash4M
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HashKind {
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

serde_plain::derive_display_from_serialize!(HashKind);
serde_plain::derive_fromstr_from_deserialize!(HashKind);

impl Default for HashKind {
    fn default() -> Self {
        HashKind::HmacSha256
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EncryptionKind {
    #[serde(rename = "AES256-GCM")]
    Aes256Gcm,
}

serde_plain::derive_display_from_serialize!(EncryptionKind);
serde_plain::derive_fromstr_from_deserialize!(EncryptionKind);

impl Default for EncryptionKind {
    fn default() -> Self {
        EncryptionKind::Aes256Gcm
    }
}

/// Per-content compression policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    None,
    Zstd,
}

impl Default for CompressionKind {
    fn default() -> Self {
        CompressionKind::Zstd
    }
}

/// Optional Reed-Solomon error correction, applied between compression and
/// encryption on the write path.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EccConfig {
    /// Space overhead in percent (1..=20).
    pub overhead_percent: u8,
}

impl EccConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.overhead_percent < 1 || self.overhead_percent > 20 {
            bail!(
                "ecc overhead must be within 1..=20 percent, got {}",
                self.overhead_percent
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionMode {
    None,
    Governance,
    Compliance,
}

impl Default for RetentionMode {
    fn default() -> Self {
        RetentionMode::None
    }
}

fn default_epoch_min_duration() -> u64 {
    3 * 3600
}
fn default_epoch_advance_on_count() -> usize {
    22
}
fn default_epoch_advance_on_size() -> u64 {
    80 * 1000 * 1000
}
fn default_epoch_checkpoint_frequency() -> u32 {
    9
}
fn default_epoch_cleanup_safety_margin() -> u64 {
    23 * 3600
}
fn default_max_clock_drift() -> u64 {
    5 * 60
}

/// Parameters driving index epoch advancement and compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EpochParameters {
    /// Minimum epoch duration in seconds before an advance is considered.
    #[serde(default = "default_epoch_min_duration")]
    pub min_duration_secs: u64,
    /// Advance once the current epoch holds this many index blobs.
    #[serde(default = "default_epoch_advance_on_count")]
    pub advance_on_count: usize,
    /// Advance once the current epoch holds this many index bytes.
    #[serde(default = "default_epoch_advance_on_size")]
    pub advance_on_size: u64,
    /// Compact everything into a single checkpoint blob every n epochs.
    #[serde(default = "default_epoch_checkpoint_frequency")]
    pub checkpoint_frequency: u32,
    /// Superseded index blobs stay readable for this long after compaction.
    #[serde(default = "default_epoch_cleanup_safety_margin")]
    pub cleanup_safety_margin_secs: u64,
    /// Tolerated wall-clock drift between writers.
    #[serde(default = "default_max_clock_drift")]
    pub max_permitted_clock_drift_secs: u64,
}

impl Default for EpochParameters {
    fn default() -> Self {
        Self {
            min_duration_secs: default_epoch_min_duration(),
            advance_on_count: default_epoch_advance_on_count(),
            advance_on_size: default_epoch_advance_on_size(),
            checkpoint_frequency: default_epoch_checkpoint_frequency(),
            cleanup_safety_margin_secs: default_epoch_cleanup_safety_margin(),
            max_permitted_clock_drift_secs: default_max_clock_drift(),
        }
    }
}

fn default_content_soft() -> u64 {
    5 * 1024 * 1024 * 1024
}
fn default_content_hard() -> u64 {
    6 * 1024 * 1024 * 1024
}
fn default_content_sweep_age() -> u64 {
    10 * 60
}
fn default_metadata_soft() -> u64 {
    5 * 1024 * 1024 * 1024
}
fn default_metadata_hard() -> u64 {
    6 * 1024 * 1024 * 1024
}
fn default_metadata_sweep_age() -> u64 {
    24 * 3600
}
fn default_blob_list_ttl() -> u64 {
    30
}

/// Local cache sizing. Soft limits trigger a sweep, hard limits refuse new
/// entries until the sweep catches up. The sweep never evicts entries younger
/// than the minimum sweep age.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheTuning {
    #[serde(default = "default_content_soft")]
    pub content_cache_soft_bytes: u64,
    #[serde(default = "default_content_hard")]
    pub content_cache_hard_bytes: u64,
    #[serde(default = "default_content_sweep_age")]
    pub content_cache_min_sweep_age_secs: u64,
    #[serde(default = "default_metadata_soft")]
    pub metadata_cache_soft_bytes: u64,
    #[serde(default = "default_metadata_hard")]
    pub metadata_cache_hard_bytes: u64,
    #[serde(default = "default_metadata_sweep_age")]
    pub metadata_cache_min_sweep_age_secs: u64,
    #[serde(default = "default_blob_list_ttl")]
    pub blob_list_cache_ttl_secs: u64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            content_cache_soft_bytes: default_content_soft(),
            content_cache_hard_bytes: default_content_hard(),
            content_cache_min_sweep_age_secs: default_content_sweep_age(),
            metadata_cache_soft_bytes: default_metadata_soft(),
            metadata_cache_hard_bytes: default_metadata_hard(),
            metadata_cache_min_sweep_age_secs: default_metadata_sweep_age(),
            blob_list_cache_ttl_secs: default_blob_list_ttl(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfKind {
    Pbkdf2Sha256,
}

/// How the master key is derived from the user passphrase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeyDerivation {
    pub algorithm: KdfKind,
    #[serde(with = "hex::serde")]
    pub salt: Vec<u8>,
    pub iterations: u32,
}

pub const MIN_PACK_SIZE: u32 = 10 * 1024 * 1024;
pub const MAX_PACK_SIZE: u32 = 120 * 1024 * 1024;
pub const DEFAULT_PACK_SIZE: u32 = 20 * 1024 * 1024;

fn default_pack_size() -> u32 {
    DEFAULT_PACK_SIZE
}

/// The repository format blob, stored as small plain JSON at
/// [FORMAT_BLOB_ID]. Everything a client needs to know before it can touch
/// any other blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryFormat {
    /// Random identity of this repository, hex encoded.
    pub unique_id: String,
    pub format_version: u32,
    pub key_derivation: KeyDerivation,
    #[serde(default)]
    pub splitter: SplitterKind,
    #[serde(default)]
    pub hash: HashKind,
    #[serde(default)]
    pub encryption: EncryptionKind,
    #[serde(default = "default_pack_size")]
    pub max_pack_size: u32,
    #[serde(default)]
    pub epoch: EpochParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecc: Option<EccConfig>,
    #[serde(default)]
    pub retention_mode: RetentionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period_secs: Option<u64>,
    #[serde(default)]
    pub required_features: Vec<String>,
    /// Fingerprint of the master key; detects a wrong passphrase at open
    /// time instead of at the first failed decrypt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<Fingerprint>,
}

/// Features this implementation understands. Opening a repository that
/// requires anything else fails permanently.
pub const SUPPORTED_FEATURES: &[&str] = &["epoch-index", "content-ecc"];

impl RepositoryFormat {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_pack_size < MIN_PACK_SIZE || self.max_pack_size > MAX_PACK_SIZE {
            bail!(
                "max-pack-size {} out of bounds ({}..={})",
                self.max_pack_size,
                MIN_PACK_SIZE,
                MAX_PACK_SIZE,
            );
        }
        if let Some(ecc) = &self.ecc {
            ecc.validate()?;
        }
        for feature in &self.required_features {
            if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
                bail!("repository requires unsupported feature '{}'", feature);
            }
        }
        Ok(())
    }
}

/// Counters reported by a garbage collection run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GarbageCollectionStatus {
    pub snapshot_count: usize,
    pub marked_contents: usize,
    pub marked_bytes: u64,
    pub tombstoned_contents: usize,
    pub tombstoned_bytes: u64,
    pub deleted_packs: usize,
    pub deleted_pack_bytes: u64,
}
