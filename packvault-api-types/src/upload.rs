//! Uploader tuning knobs and the statistics block embedded into snapshot
//! manifests.

use serde::{Deserialize, Serialize};

fn default_checkpoint_interval() -> u64 {
    // must stay below the 45 minute resume window
    20 * 60
}
fn default_checkpoint_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

/// Recognized uploader options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UploaderTuning {
    /// Worker count, defaults to the CPU count when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_uploads: Option<usize>,
    /// Seconds between checkpoints (incomplete snapshot manifests).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
    /// Additionally checkpoint after this many newly hashed bytes.
    #[serde(default = "default_checkpoint_bytes")]
    pub checkpoint_bytes: u64,
    /// Percentage of cache-eligible files that get re-hashed anyway.
    #[serde(default)]
    pub force_hash_percent: u8,
    /// Abort the whole upload on the first fatal entry error.
    #[serde(default)]
    pub fail_fast: bool,
    /// Skip writing a manifest when the root object id did not change.
    #[serde(default)]
    pub ignore_identical_snapshots: bool,
    /// Optional upload bandwidth cap in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_limit: Option<u64>,
}

impl Default for UploaderTuning {
    fn default() -> Self {
        Self {
            parallel_uploads: None,
            checkpoint_interval_secs: default_checkpoint_interval(),
            checkpoint_bytes: default_checkpoint_bytes(),
            force_hash_percent: 0,
            fail_fast: false,
            ignore_identical_snapshots: false,
            upload_limit: None,
        }
    }
}

/// Statistics block of a snapshot manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotStats {
    pub total_file_count: u64,
    pub total_dir_count: u64,
    pub total_bytes: u64,
    /// Files whose object id was reused from the previous manifest.
    pub cached_files: u64,
    pub cached_bytes: u64,
    /// Files that were actually read and hashed.
    pub hashed_files: u64,
    pub hashed_bytes: u64,
    pub ignored_errors: u64,
    pub fatal_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults() {
        let tuning: UploaderTuning = serde_json::from_str("{}").unwrap();
        assert!(tuning.parallel_uploads.is_none());
        assert_eq!(tuning.checkpoint_interval_secs, 20 * 60);
        assert!(tuning.checkpoint_interval_secs < 45 * 60);
        assert!(!tuning.fail_fast);
    }
}
