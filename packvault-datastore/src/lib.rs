//! The packvault storage core.
//!
//! # Data model
//!
//! File bytes are cut into variable-size chunks by a content defined
//! splitter. Each chunk becomes a *content*: identified by a keyed digest of
//! its plaintext, stored exactly once, compressed and encrypted, and
//! appended to a large *pack blob* together with many others. A sorted
//! binary *index blob* maps content ids to their pack location; the union of
//! all index blobs is the live index, partitioned into *epochs* that close
//! and get compacted over time.
//!
//! Directory trees are recorded as manifests referencing *objects*: a small
//! object is a content directly, a large one is an indirect list of
//! `(offset, child)` entries, nesting as deep as needed.
//!
//! # Write ordering
//!
//! A pack blob is always uploaded before the index blob describing it, and
//! directory manifests are only hashed after all their children were
//! appended to a pack. Readers that observe an index entry can therefore
//! reach its bytes, modulo transient listing lag, which they absorb with a
//! single index refresh.
//!
//! # Garbage collection
//!
//! Snapshot manifests are the GC roots. Unreachable contents are tombstoned
//! (never rewritten in place), and a pack is deleted only once every content
//! in it is tombstoned and the pack has outlived the safety margin. The
//! repository write lock serializes GC, compaction races stay advisory.

pub mod backend;
pub mod cache;
pub mod chunker;
pub mod content_codec;
pub mod content_id;
pub mod content_store;
pub mod crypt_config;
pub mod error;
pub mod file_formats;
pub mod gc;
pub mod index;
pub mod lock;
pub mod manifest;
pub mod object;
pub mod pack;
pub mod repository;

pub use backend::{BlobMeta, BlobStore, FilesystemStore, MemoryStore, PutOptions};
pub use chunker::{Chunker, FixedChunker, Splitter};
pub use content_id::{Category, ContentId};
pub use content_store::{Caches, ContentManager, ContentManagerConfig};
pub use crypt_config::CryptConfig;
pub use error::{StoreError, StoreResult};
pub use gc::GcOptions;
pub use index::{CombinedIndex, EpochManager, IndexEntry};
pub use lock::{LockGuard, LockOptions};
pub use manifest::{
    DirEntry, DirManifest, DirSummary, EntryKind, SnapshotManifest, MANIFEST_TYPE_SNAPSHOT,
};
pub use object::{
    object_content_ids, read_object, verify_object, ObjectId, ObjectReader, ObjectWriter,
    VerifyIssue, VerifyReport,
};
pub use pack::{PackClass, PackId, PackWriter};
pub use repository::{CreateOptions, OpenOptions, Repository};
