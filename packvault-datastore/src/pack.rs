//! Pack blobs.
//!
//! A pack is an append-only concatenation of encrypted contents followed by a
//! trailer: a pack-local index of `(content id, offset, lengths, layers)`
//! records sorted by id, and a final little-endian u32 with the trailer
//! length. Packs are immutable once uploaded. Data contents go into `p`
//! packs, everything else into `q` packs.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};

use crate::content_id::{ContentId, CONTENT_ID_SIZE};
use crate::content_codec::EncodedContent;
use crate::error::{StoreError, StoreResult};
use crate::file_formats::{
    DATA_PACK_PREFIX, ENTRY_FLAG_ECC, METADATA_PACK_PREFIX, PACK_TRAILER_MAGIC_1_0,
};

/// Random bytes in a pack id; the leading [SESSION_ID_SIZE] of them identify
/// the writing session.
pub const PACK_ID_SIZE: usize = 16;
pub const SESSION_ID_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackClass {
    Data,
    Metadata,
}

impl PackClass {
    pub fn prefix(&self) -> char {
        match self {
            PackClass::Data => DATA_PACK_PREFIX,
            PackClass::Metadata => METADATA_PACK_PREFIX,
        }
    }

    pub fn for_content(id: &ContentId) -> Self {
        if id.category().is_metadata() {
            PackClass::Metadata
        } else {
            PackClass::Data
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackId {
    class: PackClass,
    random: [u8; PACK_ID_SIZE],
}

impl PackId {
    /// Generate a fresh pack id carrying the session identifier.
    pub fn generate(class: PackClass, session: &[u8; SESSION_ID_SIZE]) -> Result<Self, Error> {
        let mut random = [0u8; PACK_ID_SIZE];
        random[..SESSION_ID_SIZE].copy_from_slice(session);
        openssl::rand::rand_bytes(&mut random[SESSION_ID_SIZE..])?;
        Ok(Self { class, random })
    }

    pub fn from_parts(class: PackClass, random: [u8; PACK_ID_SIZE]) -> Self {
        Self { class, random }
    }

    pub fn class(&self) -> PackClass {
        self.class
    }

    /// The 16 random bytes stored in index entries; the class is recovered
    /// from the owning content id on decode.
    pub fn random(&self) -> &[u8; PACK_ID_SIZE] {
        &self.random
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.class.prefix(), hex::encode(self.random))
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PackId({})", self)
    }
}

impl FromStr for PackId {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        if text.len() != 1 + PACK_ID_SIZE * 2 {
            bail!("pack id has wrong length {}", text.len());
        }
        let class = match text.as_bytes()[0] {
            b'p' => PackClass::Data,
            b'q' => PackClass::Metadata,
            other => bail!("unknown pack class prefix {:#04x}", other),
        };
        let raw = hex::decode(&text[1..])?;
        let mut random = [0u8; PACK_ID_SIZE];
        random.copy_from_slice(&raw);
        Ok(Self { class, random })
    }
}

/// One content recorded in an open (or sealed) pack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedContent {
    pub id: ContentId,
    pub offset: u32,
    pub packed_length: u32,
    pub original_length: u32,
    pub compression_id: u32,
    pub ecc: bool,
}

const TRAILER_ENTRY_SIZE: usize = CONTENT_ID_SIZE + 4 + 4 + 4 + 4 + 1;

/// In-memory builder for a pack blob. Appends are cheap memcpys; sealing
/// produces the final bytes including the trailer. The caller serializes
/// access (short mutex, no I/O while holding it).
pub struct PackWriter {
    id: PackId,
    buf: Vec<u8>,
    contents: Vec<PackedContent>,
}

impl PackWriter {
    pub fn new(class: PackClass, session: &[u8; SESSION_ID_SIZE]) -> Result<Self, Error> {
        Ok(Self {
            id: PackId::generate(class, session)?,
            buf: Vec::new(),
            contents: Vec::new(),
        })
    }

    pub fn id(&self) -> PackId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn content_count(&self) -> usize {
        self.contents.len()
    }

    /// Append one encoded content, returning its offset within the pack.
    pub fn append(&mut self, id: ContentId, encoded: &EncodedContent) -> StoreResult<u32> {
        debug_assert_eq!(PackClass::for_content(&id), self.id.class());
        let offset = u32::try_from(self.buf.len())
            .map_err(|_| StoreError::permanent("pack grew past 4 GiB"))?;
        self.buf.extend_from_slice(&encoded.data);
        self.contents.push(PackedContent {
            id,
            offset,
            packed_length: encoded.data.len() as u32,
            original_length: encoded.original_length,
            compression_id: encoded.compression_id,
            ecc: encoded.ecc,
        });
        Ok(offset)
    }

    /// Find a content still buffered in this open pack and return its
    /// record plus the encoded bytes. Serves reads that arrive before the
    /// pack is sealed.
    pub fn find_pending(&self, id: &ContentId) -> Option<(PackedContent, &[u8])> {
        let content = self.contents.iter().find(|content| content.id == *id)?;
        let start = content.offset as usize;
        let end = start + content.packed_length as usize;
        Some((content.clone(), &self.buf[start..end]))
    }

    /// Seal the pack: append the trailer and hand back everything needed to
    /// upload it and to emit index entries.
    pub fn seal(mut self) -> SealedPack {
        self.contents.sort_by(|a, b| a.id.cmp(&b.id));

        let trailer_len = 4 + 4 + self.contents.len() * TRAILER_ENTRY_SIZE;
        self.buf.reserve(trailer_len + 4);
        self.buf.extend_from_slice(&PACK_TRAILER_MAGIC_1_0);
        self.buf
            .extend_from_slice(&(self.contents.len() as u32).to_le_bytes());
        for content in &self.contents {
            self.buf.extend_from_slice(&content.id.to_wire());
            self.buf.extend_from_slice(&content.offset.to_le_bytes());
            self.buf
                .extend_from_slice(&content.packed_length.to_le_bytes());
            self.buf
                .extend_from_slice(&content.original_length.to_le_bytes());
            self.buf
                .extend_from_slice(&content.compression_id.to_le_bytes());
            self.buf
                .push(if content.ecc { ENTRY_FLAG_ECC } else { 0 });
        }
        self.buf.extend_from_slice(&(trailer_len as u32).to_le_bytes());

        SealedPack {
            id: self.id,
            data: self.buf,
            contents: self.contents,
        }
    }
}

/// A sealed pack ready for upload.
pub struct SealedPack {
    pub id: PackId,
    pub data: Vec<u8>,
    pub contents: Vec<PackedContent>,
}

/// Parse the trailer of a pack blob. Used by verify and by disaster
/// recovery when index blobs are lost.
pub fn read_trailer(class: PackClass, data: &[u8]) -> StoreResult<Vec<PackedContent>> {
    if data.len() < 4 + 4 + 4 {
        return Err(StoreError::Corrupted("pack too short for trailer".into()));
    }
    let trailer_len =
        u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
    if trailer_len + 4 > data.len() {
        return Err(StoreError::Corrupted("pack trailer length out of range".into()));
    }
    let trailer = &data[data.len() - 4 - trailer_len..data.len() - 4];
    if trailer[0..4] != PACK_TRAILER_MAGIC_1_0 {
        return Err(StoreError::Corrupted("bad pack trailer magic".into()));
    }
    let count = u32::from_le_bytes(trailer[4..8].try_into().unwrap()) as usize;
    if trailer.len() != 8 + count * TRAILER_ENTRY_SIZE {
        return Err(StoreError::Corrupted("pack trailer entry count mismatch".into()));
    }

    let mut contents = Vec::with_capacity(count);
    let mut cursor = &trailer[8..];
    for _ in 0..count {
        let id = ContentId::from_wire(&cursor[..CONTENT_ID_SIZE])
            .map_err(|err| StoreError::Corrupted(format!("bad trailer entry id - {}", err)))?;
        if PackClass::for_content(&id) != class {
            return Err(StoreError::Corrupted(format!(
                "content {} in wrong pack class",
                id
            )));
        }
        let offset = u32::from_le_bytes(cursor[33..37].try_into().unwrap());
        let packed_length = u32::from_le_bytes(cursor[37..41].try_into().unwrap());
        let original_length = u32::from_le_bytes(cursor[41..45].try_into().unwrap());
        let compression_id = u32::from_le_bytes(cursor[45..49].try_into().unwrap());
        let flags = cursor[49];
        contents.push(PackedContent {
            id,
            offset,
            packed_length,
            original_length,
            compression_id,
            ecc: flags & ENTRY_FLAG_ECC != 0,
        });
        cursor = &cursor[TRAILER_ENTRY_SIZE..];
    }
    Ok(contents)
}
