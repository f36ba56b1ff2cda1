//! The uploader's view of policy.
//!
//! Policy evaluation (pattern trees, per-directory overrides, retention
//! schedules) lives outside the core; the uploader only consumes this small
//! capability trait. The default implementation excludes nothing,
//! compresses everything and ignores per-entry errors.

use std::path::Path;

use packvault_api_types::CompressionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryErrorKind {
    FileRead,
    DirRead,
    UnknownType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Count it, record it in the directory summary, move on.
    Ignore,
    /// Abort the enclosing subtree (and the upload under fail-fast).
    Fatal,
}

pub trait UploadPolicy: Send + Sync {
    /// Entries reporting true are not descended into or uploaded.
    fn excludes(&self, _rel_path: &Path, _is_dir: bool) -> bool {
        false
    }

    fn compression(&self, _rel_path: &Path) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn on_error(&self, _kind: EntryErrorKind) -> ErrorAction {
        ErrorAction::Ignore
    }
}

pub struct DefaultPolicy;

impl UploadPolicy for DefaultPolicy {}

/// Simple name-based policy, enough for embedders that do not carry a full
/// policy engine.
pub struct BasicPolicy {
    pub excluded_names: Vec<String>,
    pub compression: CompressionKind,
    pub file_errors: ErrorAction,
    pub dir_errors: ErrorAction,
}

impl Default for BasicPolicy {
    fn default() -> Self {
        Self {
            excluded_names: Vec::new(),
            compression: CompressionKind::Zstd,
            file_errors: ErrorAction::Ignore,
            dir_errors: ErrorAction::Fatal,
        }
    }
}

impl UploadPolicy for BasicPolicy {
    fn excludes(&self, rel_path: &Path, _is_dir: bool) -> bool {
        match rel_path.file_name().and_then(|name| name.to_str()) {
            Some(name) => self.excluded_names.iter().any(|excluded| excluded == name),
            None => false,
        }
    }

    fn compression(&self, _rel_path: &Path) -> CompressionKind {
        self.compression
    }

    fn on_error(&self, kind: EntryErrorKind) -> ErrorAction {
        match kind {
            EntryErrorKind::FileRead | EntryErrorKind::UnknownType => self.file_errors,
            EntryErrorKind::DirRead => self.dir_errors,
        }
    }
}
