//! Snapshot creation and restore on top of the packvault datastore.
//!
//! [Uploader] walks a local tree into a snapshot manifest; [restore] turns
//! a manifest back into files. Policy decisions (what to skip, how to
//! compress, which errors are fatal) come in through the [policy] traits,
//! progress goes out through [progress::ProgressSink], and every long
//! operation observes a cancellation token.

pub mod policy;
pub mod progress;
pub mod restore;
pub mod uploader;

pub use policy::{BasicPolicy, DefaultPolicy, EntryErrorKind, ErrorAction, UploadPolicy};
pub use progress::{LogProgress, NullProgress, ProgressSink, UploadCounters};
pub use restore::{restore_snapshot, RestoreStats};
pub use uploader::{latest_snapshot_for_path, Uploader};
