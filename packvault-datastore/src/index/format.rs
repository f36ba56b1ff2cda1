//! Bit-exact index blob codec.
//!
//! ```text
//! header:  magic[4] version:u8 entry_size:u8 entry_count:u32
//! entries: entry_count fixed-size records, sorted by content id:
//!          content_id[33] flags:u8 format_version:u8 pack_blob_id[16]
//!          pack_offset:u32 packed_length:u32 original_length:u32
//!          timestamp_seconds:u32 compression_header_id:u32
//!          encryption_key_id:u32
//! ```
//!
//! All integers little endian. The entry size is written to the header, so
//! readers reject records they cannot interpret instead of misparsing them.

use crate::content_id::{ContentId, CONTENT_ID_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::file_formats::{INDEX_BLOB_MAGIC_1_0, INDEX_FORMAT_VERSION, INDEX_FORMAT_VERSION_V0};
use crate::pack::{PackClass, PackId, PACK_ID_SIZE};

use super::IndexEntry;

pub const INDEX_HEADER_SIZE: usize = 4 + 1 + 1 + 4;
pub const INDEX_ENTRY_SIZE: usize = CONTENT_ID_SIZE + 1 + 1 + PACK_ID_SIZE + 4 + 4 + 4 + 4 + 4 + 4;

/// Serialize entries into an index blob. Entries are sorted by
/// `(content id, timestamp)`; duplicate ids are allowed (a compaction blob
/// may carry a write and its later tombstone).
pub fn encode_index_blob(version: u8, entries: &mut Vec<IndexEntry>) -> Vec<u8> {
    entries.sort_by(|a, b| (a.id, a.timestamp).cmp(&(b.id, b.timestamp)));

    let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE);
    out.extend_from_slice(&INDEX_BLOB_MAGIC_1_0);
    out.push(version);
    out.push(INDEX_ENTRY_SIZE as u8);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    for entry in entries.iter() {
        out.extend_from_slice(&entry.id.to_wire());
        out.push(entry.flags);
        out.push(entry.format_version);
        out.extend_from_slice(entry.pack_id.random());
        out.extend_from_slice(&entry.pack_offset.to_le_bytes());
        out.extend_from_slice(&entry.packed_length.to_le_bytes());
        out.extend_from_slice(&entry.original_length.to_le_bytes());
        out.extend_from_slice(&entry.timestamp.to_le_bytes());
        out.extend_from_slice(&entry.compression_id.to_le_bytes());
        out.extend_from_slice(&entry.encryption_key_id.to_le_bytes());
    }
    out
}

/// Decode an index blob, returning its format version and entries.
pub fn decode_index_blob(data: &[u8]) -> StoreResult<(u8, Vec<IndexEntry>)> {
    if data.len() < INDEX_HEADER_SIZE {
        return Err(StoreError::Corrupted("index blob too short".into()));
    }
    if data[0..4] != INDEX_BLOB_MAGIC_1_0 {
        return Err(StoreError::Corrupted("bad index blob magic".into()));
    }
    let version = data[4];
    if version != INDEX_FORMAT_VERSION && version != INDEX_FORMAT_VERSION_V0 {
        return Err(StoreError::permanent(format!(
            "unsupported index format version {}",
            version
        )));
    }
    let entry_size = data[5] as usize;
    if entry_size != INDEX_ENTRY_SIZE {
        return Err(StoreError::permanent(format!(
            "unsupported index entry size {}",
            entry_size
        )));
    }
    let count = u32::from_le_bytes(data[6..10].try_into().unwrap()) as usize;
    if data.len() != INDEX_HEADER_SIZE + count * entry_size {
        return Err(StoreError::Corrupted("index blob size mismatch".into()));
    }

    let mut entries = Vec::with_capacity(count);
    let mut prev: Option<ContentId> = None;
    let mut cursor = &data[INDEX_HEADER_SIZE..];
    for _ in 0..count {
        let id = ContentId::from_wire(&cursor[..CONTENT_ID_SIZE])
            .map_err(|err| StoreError::Corrupted(format!("bad index entry id - {}", err)))?;
        if let Some(prev) = prev {
            if id < prev {
                return Err(StoreError::Corrupted("index entries out of order".into()));
            }
        }
        prev = Some(id);

        let mut pack_random = [0u8; PACK_ID_SIZE];
        pack_random.copy_from_slice(&cursor[35..51]);
        entries.push(IndexEntry {
            id,
            flags: cursor[33],
            format_version: cursor[34],
            pack_id: PackId::from_parts(PackClass::for_content(&id), pack_random),
            pack_offset: u32::from_le_bytes(cursor[51..55].try_into().unwrap()),
            packed_length: u32::from_le_bytes(cursor[55..59].try_into().unwrap()),
            original_length: u32::from_le_bytes(cursor[59..63].try_into().unwrap()),
            timestamp: u32::from_le_bytes(cursor[63..67].try_into().unwrap()),
            compression_id: u32::from_le_bytes(cursor[67..71].try_into().unwrap()),
            encryption_key_id: u32::from_le_bytes(cursor[71..75].try_into().unwrap()),
        });
        cursor = &cursor[entry_size..];
    }
    Ok((version, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::Category;
    use crate::file_formats::ENTRY_FLAG_DELETED;

    fn entry(fill: u8, timestamp: u32) -> IndexEntry {
        IndexEntry {
            id: ContentId::new(Category::Data, [fill; 32]),
            flags: 0,
            format_version: 1,
            pack_id: PackId::from_parts(PackClass::Data, [fill; 16]),
            pack_offset: fill as u32 * 100,
            packed_length: 512,
            original_length: 600,
            timestamp,
            compression_id: 1,
            encryption_key_id: 0,
        }
    }

    #[test]
    fn entry_size_matches_layout() {
        assert_eq!(INDEX_ENTRY_SIZE, 75);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut entries = vec![entry(9, 100), entry(2, 50), entry(5, 75)];
        let blob = encode_index_blob(INDEX_FORMAT_VERSION, &mut entries);
        assert_eq!(blob.len(), INDEX_HEADER_SIZE + 3 * INDEX_ENTRY_SIZE);

        let (version, decoded) = decode_index_blob(&blob).unwrap();
        assert_eq!(version, INDEX_FORMAT_VERSION);
        assert_eq!(decoded.len(), 3);
        // sorted by id
        assert_eq!(decoded[0].id, ContentId::new(Category::Data, [2; 32]));
        assert_eq!(decoded[2].id, ContentId::new(Category::Data, [9; 32]));
        assert_eq!(decoded, entries);
    }

    #[test]
    fn duplicate_ids_sorted_by_timestamp() {
        let mut tombstone = entry(4, 900);
        tombstone.flags = ENTRY_FLAG_DELETED;
        let mut entries = vec![tombstone.clone(), entry(4, 100)];
        let blob = encode_index_blob(INDEX_FORMAT_VERSION, &mut entries);
        let (_, decoded) = decode_index_blob(&blob).unwrap();
        assert_eq!(decoded[0].timestamp, 100);
        assert_eq!(decoded[1], tombstone);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_index_blob(b"short").is_err());

        let mut entries = vec![entry(1, 1)];
        let mut blob = encode_index_blob(INDEX_FORMAT_VERSION, &mut entries);
        blob[0] ^= 0xff;
        assert!(decode_index_blob(&blob).is_err());

        let mut entries = vec![entry(1, 1)];
        let mut blob = encode_index_blob(INDEX_FORMAT_VERSION, &mut entries);
        blob.truncate(blob.len() - 1);
        assert!(decode_index_blob(&blob).is_err());

        let mut entries = vec![entry(1, 1)];
        let mut blob = encode_index_blob(3, &mut entries);
        assert!(matches!(
            decode_index_blob(&blob),
            Err(StoreError::Permanent { .. })
        ));
    }

    #[test]
    fn empty_blob_round_trips() {
        let blob = encode_index_blob(INDEX_FORMAT_VERSION, &mut Vec::new());
        let (_, decoded) = decode_index_blob(&blob).unwrap();
        assert!(decoded.is_empty());
    }
}
