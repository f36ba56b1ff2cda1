// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// openssl::sha::sha256(b"PackVault pack trailer v1.0")[0..4]
pub const PACK_TRAILER_MAGIC_1_0: [u8; 4] = [155, 82, 253, 77];

// openssl::sha::sha256(b"PackVault index blob v1.0")[0..4]
pub const INDEX_BLOB_MAGIC_1_0: [u8; 4] = [218, 105, 132, 196];

// openssl::sha::sha256(b"PackVault object list v1.0")[0..4]
pub const OBJECT_LIST_MAGIC_1_0: [u8; 4] = [131, 143, 25, 124];

// openssl::sha::sha256(b"PackVault ECC frame v1.0")[0..4]
pub const ECC_FRAME_MAGIC_1_0: [u8; 4] = [122, 244, 204, 55];

/// Index blob format version written by this implementation.
pub const INDEX_FORMAT_VERSION: u8 = 1;

/// Legacy flat (epoch-less) index blobs.
pub const INDEX_FORMAT_VERSION_V0: u8 = 0;

/// Compression header ids recorded per index entry. The content bytes carry
/// no compression framing of their own.
pub const COMPRESSION_HEADER_NONE: u32 = 0;
pub const COMPRESSION_HEADER_ZSTD: u32 = 1;

/// Index entry flag bits.
pub const ENTRY_FLAG_DELETED: u8 = 1 << 0;
pub const ENTRY_FLAG_ECC: u8 = 1 << 1;

/// Blob name prefixes of the persisted repository layout.
pub const DATA_PACK_PREFIX: char = 'p';
pub const METADATA_PACK_PREFIX: char = 'q';
pub const INDEX_BLOB_PREFIX: char = 'x';
pub const LEGACY_INDEX_BLOB_PREFIX: char = 'n';
pub const EPOCH_MARKER_PREFIX: char = 'e';
