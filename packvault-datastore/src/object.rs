//! The object manager: streaming files in and out of contents.
//!
//! An object id is either a content id directly (single-chunk objects,
//! manifests) or an `I`-prefixed indirect reference to a list content of
//! `(end offset, child object id)` entries. Lists that grow past the fanout
//! are themselves split and wrapped by a higher level list, nesting to
//! arbitrary depth; the top level id is the object's canonical id.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use packvault_api_types::{CompressionKind, SplitterKind};
use packvault_tools::Cancel;

use crate::chunker::Splitter;
use crate::content_id::{Category, ContentId, CONTENT_ID_SIZE};
use crate::content_store::ContentManager;
use crate::error::{check_cancelled, StoreError, StoreResult};
use crate::file_formats::OBJECT_LIST_MAGIC_1_0;
use crate::pack::PackId;

/// Children per list content before another indirection level is added.
const OBJECT_LIST_FANOUT: usize = 4096;

const LIST_ENTRY_SIZE: usize = 8 + 1 + CONTENT_ID_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    indirect: bool,
    content: ContentId,
}

impl ObjectId {
    pub fn direct(content: ContentId) -> Self {
        Self {
            indirect: false,
            content,
        }
    }

    pub fn indirect(content: ContentId) -> Self {
        Self {
            indirect: true,
            content,
        }
    }

    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    pub fn content_id(&self) -> ContentId {
        self.content
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.indirect {
            write!(f, "I")?;
        }
        write!(f, "{}", self.content)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        if let Some(rest) = text.strip_prefix('I') {
            Ok(Self::indirect(rest.parse()?))
        } else {
            Ok(Self::direct(text.parse()?))
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ListEntry {
    /// Absolute end offset within the object.
    end: u64,
    child: ObjectId,
}

fn encode_list(entries: &[ListEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + entries.len() * LIST_ENTRY_SIZE);
    out.extend_from_slice(&OBJECT_LIST_MAGIC_1_0);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.end.to_le_bytes());
        out.push(entry.child.is_indirect() as u8);
        out.extend_from_slice(&entry.child.content_id().to_wire());
    }
    out
}

fn decode_list(data: &[u8]) -> StoreResult<Vec<ListEntry>> {
    if data.len() < 8 || data[0..4] != OBJECT_LIST_MAGIC_1_0 {
        return Err(StoreError::Corrupted("bad object list magic".into()));
    }
    let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if data.len() != 8 + count * LIST_ENTRY_SIZE {
        return Err(StoreError::Corrupted("object list size mismatch".into()));
    }
    let mut entries = Vec::with_capacity(count);
    let mut cursor = &data[8..];
    let mut prev_end = 0u64;
    for _ in 0..count {
        let end = u64::from_le_bytes(cursor[0..8].try_into().unwrap());
        if end < prev_end {
            return Err(StoreError::Corrupted("object list offsets not monotone".into()));
        }
        prev_end = end;
        let indirect = match cursor[8] {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::Corrupted(format!(
                    "bad object list entry flag {}",
                    other
                )))
            }
        };
        let content = ContentId::from_wire(&cursor[9..9 + CONTENT_ID_SIZE])
            .map_err(|err| StoreError::Corrupted(format!("bad object list id - {}", err)))?;
        entries.push(ListEntry {
            end,
            child: if indirect {
                ObjectId::indirect(content)
            } else {
                ObjectId::direct(content)
            },
        });
        cursor = &cursor[LIST_ENTRY_SIZE..];
    }
    Ok(entries)
}

/// Streams a byte sequence into chunked contents and produces the object id.
pub struct ObjectWriter<'a> {
    cm: &'a ContentManager,
    category: Category,
    compression: CompressionKind,
    splitter: Splitter,
    buffer: Vec<u8>,
    scan_pos: usize,
    entries: Vec<ListEntry>,
    written: u64,
    fanout: usize,
}

impl<'a> ObjectWriter<'a> {
    pub fn new(
        cm: &'a ContentManager,
        splitter: SplitterKind,
        category: Category,
        compression: CompressionKind,
    ) -> Self {
        Self {
            cm,
            category,
            compression,
            splitter: Splitter::new(splitter),
            buffer: Vec::new(),
            scan_pos: 0,
            entries: Vec::new(),
            written: 0,
            fanout: OBJECT_LIST_FANOUT,
        }
    }

    #[cfg(test)]
    fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(data);
        loop {
            if self.scan_pos >= self.buffer.len() {
                break;
            }
            let boundary = self.splitter.scan(&self.buffer[self.scan_pos..]);
            if boundary == 0 {
                self.scan_pos = self.buffer.len();
                break;
            }
            let chunk_size = self.scan_pos + boundary;
            let rest = self.buffer.split_off(chunk_size);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.scan_pos = 0;
            self.emit_chunk(&chunk)?;
        }
        Ok(())
    }

    fn emit_chunk(&mut self, chunk: &[u8]) -> StoreResult<()> {
        let id = self
            .cm
            .write_content(self.category, chunk, self.compression)?;
        self.written += chunk.len() as u64;
        self.entries.push(ListEntry {
            end: self.written,
            child: ObjectId::direct(id),
        });
        Ok(())
    }

    /// Flush the final chunk and collapse the entry list into the object id.
    pub fn finish(mut self) -> StoreResult<ObjectId> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.emit_chunk(&tail)?;
        }
        if self.entries.is_empty() {
            // canonical empty object: one content of length zero
            self.emit_chunk(&[])?;
        }

        let mut entries = self.entries;
        while entries.len() > 1 {
            let mut next = Vec::with_capacity(entries.len() / self.fanout + 1);
            for group in entries.chunks(self.fanout) {
                let bytes = encode_list(group);
                let id =
                    self.cm
                        .write_content(Category::Metadata, &bytes, CompressionKind::Zstd)?;
                next.push(ListEntry {
                    end: group.last().unwrap().end,
                    child: ObjectId::indirect(id),
                });
            }
            entries = next;
        }
        Ok(entries.remove(0).child)
    }
}

#[derive(Clone, Debug)]
struct FlatEntry {
    start: u64,
    end: u64,
    content: ContentId,
}

enum WalkNode {
    List(u64, ObjectId),
    Chunk(FlatEntry),
}

/// Resolve an object id down to its flat `(range, content)` sequence.
///
/// List entries carry absolute end offsets at every nesting level, so the
/// walk only threads start offsets through.
fn flatten(cm: &ContentManager, oid: &ObjectId) -> StoreResult<Vec<FlatEntry>> {
    if !oid.is_indirect() {
        // a direct object's length comes from the index
        let length = cm.content_length(&oid.content_id())?;
        return Ok(vec![FlatEntry {
            start: 0,
            end: length,
            content: oid.content_id(),
        }]);
    }

    let mut flat = Vec::new();
    let mut stack = vec![WalkNode::List(0, *oid)];
    while let Some(node) = stack.pop() {
        match node {
            WalkNode::Chunk(entry) => flat.push(entry),
            WalkNode::List(start, oid) => {
                let bytes = cm.read_content(&oid.content_id())?;
                let entries = decode_list(&bytes)?;
                let mut children = Vec::with_capacity(entries.len());
                let mut child_start = start;
                for entry in entries {
                    if entry.end < child_start {
                        return Err(StoreError::Corrupted(
                            "object list extents overlap".into(),
                        ));
                    }
                    children.push((child_start, entry.end, entry.child));
                    child_start = entry.end;
                }
                // reversed, so the leftmost child pops first
                for (child_start, end, child) in children.into_iter().rev() {
                    if child.is_indirect() {
                        stack.push(WalkNode::List(child_start, child));
                    } else {
                        stack.push(WalkNode::Chunk(FlatEntry {
                            start: child_start,
                            end,
                            content: child.content_id(),
                        }));
                    }
                }
            }
        }
    }
    Ok(flat)
}

/// Random access reader over an object. Implements [Read] and [Seek]; the
/// most recently touched chunk is memoized, so sequential reads fetch each
/// content once.
pub struct ObjectReader<'a> {
    cm: &'a ContentManager,
    entries: Vec<FlatEntry>,
    length: u64,
    pos: u64,
    current: Option<(usize, Vec<u8>)>,
}

impl<'a> ObjectReader<'a> {
    pub fn new(cm: &'a ContentManager, oid: &ObjectId) -> StoreResult<Self> {
        let entries = flatten(cm, oid)?;
        let length = entries.last().map(|entry| entry.end).unwrap_or(0);
        Ok(Self {
            cm,
            entries,
            length,
            pos: 0,
            current: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read at an absolute offset without moving the cursor.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<usize> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }
        // first entry whose end is past the offset covers it
        let idx = self.entries.partition_point(|entry| entry.end <= offset);
        let entry = self.entries[idx].clone();

        let cached = matches!(&self.current, Some((current_idx, _)) if *current_idx == idx);
        if !cached {
            let data = self.cm.read_content(&entry.content)?;
            if data.len() as u64 != entry.end - entry.start {
                return Err(StoreError::Corrupted(format!(
                    "content {} length does not match object extent",
                    entry.content
                )));
            }
            self.current = Some((idx, data));
        }
        let chunk = &self.current.as_ref().unwrap().1;

        let within = (offset - entry.start) as usize;
        let available = chunk.len() - within;
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&chunk[within..within + count]);
        Ok(count)
    }
}

impl Read for ObjectReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self
            .read_at(self.pos, buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for ObjectReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Every content id an object references: its chunk contents plus the list
/// contents of all indirection levels. The chunk data itself is not read.
pub fn object_content_ids(cm: &ContentManager, oid: &ObjectId) -> StoreResult<Vec<ContentId>> {
    let mut ids = Vec::new();
    let mut stack = vec![*oid];
    while let Some(oid) = stack.pop() {
        ids.push(oid.content_id());
        if oid.is_indirect() {
            let bytes = cm.read_content(&oid.content_id())?;
            for entry in decode_list(&bytes)? {
                stack.push(entry.child);
            }
        }
    }
    Ok(ids)
}

/// Convenience full read of an object.
pub fn read_object(cm: &ContentManager, oid: &ObjectId) -> StoreResult<Vec<u8>> {
    let mut reader = ObjectReader::new(cm, oid)?;
    let mut data = Vec::with_capacity(reader.len() as usize);
    reader
        .read_to_end(&mut data)
        .map_err(|err| StoreError::Corrupted(format!("object read failed - {}", err)))?;
    Ok(data)
}

#[derive(Clone, Debug)]
pub struct VerifyIssue {
    pub content: ContentId,
    pub pack: Option<PackId>,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub contents: usize,
    pub bytes: u64,
    pub issues: Vec<VerifyIssue>,
}

/// Walk an object graph and check that every referenced content resolves in
/// the index. `sample_percent` of the contents (chosen deterministically by
/// digest) are additionally downloaded and digest-checked.
pub fn verify_object(
    cm: &ContentManager,
    oid: &ObjectId,
    sample_percent: u8,
    cancel: &Cancel,
    report: &mut VerifyReport,
) -> StoreResult<()> {
    let index = cm.index_snapshot();
    let entries = flatten(cm, oid)?;

    if oid.is_indirect() {
        // the list contents themselves were just read successfully; still
        // count them
        report.contents += 1;
    }

    for entry in entries {
        check_cancelled(cancel)?;
        report.contents += 1;
        report.bytes += entry.end - entry.start;

        let indexed = match index.lookup(&entry.content) {
            Some(indexed) => indexed.clone(),
            None => {
                report.issues.push(VerifyIssue {
                    content: entry.content,
                    pack: None,
                    error: "content missing from index".to_string(),
                });
                continue;
            }
        };

        let sampled = sample_percent > 0
            && (entry.content.digest()[0] as u32 * 100 / 256) < sample_percent as u32;
        if sampled {
            if let Err(err) = cm.read_content(&entry.content) {
                report.issues.push(VerifyIssue {
                    content: entry.content,
                    pack: Some(indexed.pack_id),
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(())
}
