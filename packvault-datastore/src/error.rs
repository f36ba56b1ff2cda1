//! Classified storage errors.
//!
//! Classification is a property of the variant, never of message matching:
//! the retry layer asks [StoreError::is_retriable], the uploader asks
//! [StoreError::is_corruption] to apply its per-entry error policy.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Blob, content or manifest absent (includes tombstoned contents).
    #[error("not found: {0}")]
    NotFound(String),

    /// A create-if-absent put hit an existing blob.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Authentication/checksum failure, or an index entry pointing at a
    /// missing blob.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Lock contention, concurrent compaction, format upgrade in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Blob is protected by a retention policy.
    #[error("retention protected: {0}")]
    RetentionProtected(String),

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Retryable backend failure.
    #[error("transient error: {context}")]
    Transient {
        context: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Auth, config, schema mismatch, retry budget exhausted.
    #[error("permanent error: {context}")]
    Permanent {
        context: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl StoreError {
    pub fn transient<S: Into<String>>(context: S) -> Self {
        StoreError::Transient {
            context: context.into(),
            source: None,
        }
    }

    pub fn permanent<S: Into<String>>(context: S) -> Self {
        StoreError::Permanent {
            context: context.into(),
            source: None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupted(_))
    }

    /// A transient error whose retry budget ran out becomes permanent.
    pub fn into_permanent(self) -> Self {
        match self {
            StoreError::Transient { context, source } => StoreError::Permanent {
                context: format!("retries exhausted: {}", context),
                source,
            },
            other => other,
        }
    }
}

/// Classify an I/O error from a blob backend or cache directory.
impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(err.to_string()),
            io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
                StoreError::Permanent {
                    context: err.to_string(),
                    source: Some(err),
                }
            }
            _ => StoreError::Transient {
                context: err.to_string(),
                source: Some(err),
            },
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Check a cancellation token at a safe point.
pub fn check_cancelled(cancel: &packvault_tools::Cancel) -> StoreResult<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(StoreError::from(not_found).is_not_found());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            StoreError::from(denied),
            StoreError::Permanent { .. }
        ));

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(StoreError::from(timeout).is_retriable());
    }

    #[test]
    fn retry_exhaustion_is_permanent() {
        let err = StoreError::transient("socket reset").into_permanent();
        assert!(!err.is_retriable());
        assert!(matches!(err, StoreError::Permanent { .. }));
    }
}
