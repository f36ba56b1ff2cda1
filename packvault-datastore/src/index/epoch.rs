//! Epoch management for the log-structured index.
//!
//! Index blobs are named `x<epoch>_<session>_<hash>`. Every writer appends
//! into the current epoch; once an epoch accumulates enough blobs, bytes or
//! wall-clock time it is closed by writing the marker blob `e<epoch>`. The
//! writer that wins the marker race compacts the closed epoch into a single
//! blob, and every `checkpoint-frequency` epochs everything so far is merged
//! into one checkpoint blob to bound cold-start cost.
//!
//! Advancement is advisory by design: losing a race costs one redundant
//! compaction blob, never visibility or correctness.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use packvault_api_types::EpochParameters;
use packvault_tools::backoff::Backoff;

use crate::backend::{with_retry, BlobStore, PutOptions};
use crate::error::{StoreError, StoreResult};
use crate::file_formats::INDEX_FORMAT_VERSION;
use crate::index::format::{decode_index_blob, encode_index_blob};
use crate::index::{CombinedIndex, IndexBlobData, IndexEntry};

/// Session token of compaction blobs (never a valid hex session id).
const COMPACTED_TOKEN: &str = "compacted";
/// Session token of checkpoint blobs covering all prior epochs.
const CHECKPOINT_TOKEN: &str = "checkpoint";

/// Body of an `e<epoch>` marker blob.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EpochMarker {
    pub epoch: u32,
    pub closed_at: i64,
}

pub struct EpochManager {
    store: Arc<dyn BlobStore>,
    params: EpochParameters,
    session_hex: String,
    backoff: Backoff,
}

fn marker_name(epoch: u32) -> String {
    format!("e{:08}", epoch)
}

fn index_blob_name(epoch: u32, token: &str, data: &[u8]) -> String {
    let digest = openssl::sha::sha256(data);
    format!("x{:08}_{}_{}", epoch, token, hex::encode(&digest[..8]))
}

/// Split an index blob name into `(epoch, session token)`.
fn parse_index_blob_name(name: &str) -> Option<(u32, &str)> {
    let rest = name.strip_prefix('x')?;
    let mut parts = rest.splitn(3, '_');
    let epoch = parts.next()?.parse::<u32>().ok()?;
    let token = parts.next()?;
    parts.next()?;
    Some((epoch, token))
}

impl EpochManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        params: EpochParameters,
        session: &[u8; 4],
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            params,
            session_hex: hex::encode(session),
            backoff,
        }
    }

    pub fn params(&self) -> &EpochParameters {
        &self.params
    }

    /// The highest closed epoch, discovered from the marker blobs. This is
    /// the cheap probe every client uses.
    pub fn highest_closed_epoch(&self) -> StoreResult<Option<u32>> {
        let markers = with_retry("list epoch markers", &self.backoff, || {
            self.store.list("e")
        })?;
        Ok(markers
            .iter()
            .filter_map(|meta| meta.id.strip_prefix('e')?.parse::<u32>().ok())
            .max())
    }

    /// The epoch new index blobs are written into.
    pub fn current_epoch(&self) -> StoreResult<u32> {
        Ok(match self.highest_closed_epoch()? {
            Some(closed) => closed + 1,
            None => 0,
        })
    }

    fn read_marker(&self, epoch: u32) -> StoreResult<Option<EpochMarker>> {
        let data = match self.store.get(&marker_name(epoch), 0, None) {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| StoreError::Corrupted(format!("bad epoch marker - {}", err)))
    }

    /// Write one index blob into the given epoch. Returns the blob name.
    pub fn write_index_blob(&self, epoch: u32, mut entries: Vec<IndexEntry>) -> StoreResult<String> {
        self.write_named_blob(epoch, &self.session_hex, &mut entries)
    }

    fn write_named_blob(
        &self,
        epoch: u32,
        token: &str,
        entries: &mut Vec<IndexEntry>,
    ) -> StoreResult<String> {
        let data = encode_index_blob(INDEX_FORMAT_VERSION, entries);
        let name = index_blob_name(epoch, token, &data);
        with_retry("upload index blob", &self.backoff, || {
            self.store.put(&name, &data, &PutOptions::default())
        })?;
        Ok(name)
    }

    fn fetch_blob(&self, name: &str, epoch: u32) -> StoreResult<IndexBlobData> {
        let data = with_retry("read index blob", &self.backoff, || {
            self.store.get(name, 0, None)
        })?;
        let (_, entries) = decode_index_blob(&data)?;
        Ok(IndexBlobData::new(name.to_string(), epoch, entries))
    }

    /// Load the live index: the newest checkpoint plus everything after it.
    pub fn load(&self) -> StoreResult<CombinedIndex> {
        self.load_upto(None)
    }

    fn load_upto(&self, upto: Option<u32>) -> StoreResult<CombinedIndex> {
        let metas = with_retry("list index blobs", &self.backoff, || self.store.list("x"))?;
        let mut parsed: Vec<(u32, String, String)> = metas
            .into_iter()
            .filter_map(|meta| {
                let (epoch, token) = parse_index_blob_name(&meta.id)?;
                Some((epoch, token.to_string(), meta.id))
            })
            .collect();
        if let Some(upto) = upto {
            parsed.retain(|(epoch, _, _)| *epoch <= upto);
        }

        let checkpoint_epoch = parsed
            .iter()
            .filter(|(_, token, _)| token == CHECKPOINT_TOKEN)
            .map(|(epoch, _, _)| *epoch)
            .max();

        let mut blobs = Vec::new();
        for (epoch, _token, name) in parsed {
            // epochs below the checkpoint stay in the backend until cleanup
            // but no longer contribute to the view; blobs at the checkpoint
            // epoch itself are loaded as a union to tolerate advance races
            let include = match checkpoint_epoch {
                Some(cp) => epoch >= cp,
                None => true,
            };
            if include {
                blobs.push(self.fetch_blob(&name, epoch)?);
            }
        }
        Ok(CombinedIndex::new(blobs))
    }

    /// Advance the current epoch if any threshold is exceeded. Returns the
    /// closed epoch number when this writer won the race and compacted it.
    pub fn maybe_advance(&self, now: i64) -> StoreResult<Option<u32>> {
        let current = self.current_epoch()?;
        let metas = with_retry("list index blobs", &self.backoff, || {
            self.store.list(&format!("x{:08}_", current))
        })?;
        if metas.is_empty() {
            return Ok(None);
        }

        let blob_count = metas.len();
        let total_bytes: u64 = metas.iter().map(|meta| meta.length).sum();

        let epoch_started = if current == 0 {
            metas.iter().map(|meta| meta.timestamp).min().unwrap_or(now)
        } else {
            match self.read_marker(current - 1)? {
                // another writer's clock stamped the marker; tolerate drift
                Some(marker) => marker.closed_at + self.params.max_permitted_clock_drift_secs as i64,
                None => metas.iter().map(|meta| meta.timestamp).min().unwrap_or(now),
            }
        };

        let due = blob_count >= self.params.advance_on_count
            || total_bytes >= self.params.advance_on_size
            || now - epoch_started >= self.params.min_duration_secs as i64;
        if !due {
            return Ok(None);
        }

        let marker = EpochMarker {
            epoch: current,
            closed_at: now,
        };
        let body = serde_json::to_vec(&marker)
            .map_err(|err| StoreError::permanent(format!("marker encode failed - {}", err)))?;
        match self
            .store
            .put(&marker_name(current), &body, &PutOptions::if_absent())
        {
            Ok(()) => (),
            // lost the election; the winner compacts
            Err(StoreError::AlreadyExists(_)) => return Ok(None),
            Err(err) => return Err(err),
        }

        self.compact_epoch(current)?;

        let next = current + 1;
        if next % self.params.checkpoint_frequency.max(1) == 0 {
            self.write_checkpoint(current)?;
        }
        Ok(Some(current))
    }

    /// Merge all regular blobs of a closed epoch into one compaction blob.
    pub fn compact_epoch(&self, epoch: u32) -> StoreResult<Option<String>> {
        let metas = with_retry("list index blobs", &self.backoff, || {
            self.store.list(&format!("x{:08}_", epoch))
        })?;

        let mut regular = Vec::new();
        for meta in metas {
            match parse_index_blob_name(&meta.id) {
                Some((_, COMPACTED_TOKEN)) => return Ok(None), // already done
                Some((_, CHECKPOINT_TOKEN)) => (),
                Some(_) => regular.push(meta.id),
                None => (),
            }
        }
        if regular.is_empty() {
            return Ok(None);
        }

        let mut blobs = Vec::new();
        for name in &regular {
            blobs.push(self.fetch_blob(name, epoch)?);
        }
        let merged = CombinedIndex::new(blobs);
        let mut entries: Vec<IndexEntry> = merged.effective_entries().into_values().collect();

        let name = self.write_named_blob(epoch, COMPACTED_TOKEN, &mut entries)?;
        log::info!(
            "compacted epoch {}: {} blobs, {} entries -> {}",
            epoch,
            regular.len(),
            entries.len(),
            name
        );
        Ok(Some(name))
    }

    /// Merge everything up to and including `epoch` into a checkpoint blob.
    pub fn write_checkpoint(&self, epoch: u32) -> StoreResult<String> {
        let merged = self.load_upto(Some(epoch))?;
        let mut entries: Vec<IndexEntry> = merged.effective_entries().into_values().collect();
        let name = self.write_named_blob(epoch, CHECKPOINT_TOKEN, &mut entries)?;
        log::info!(
            "checkpoint at epoch {}: {} entries -> {}",
            epoch,
            entries.len(),
            name
        );
        Ok(name)
    }

    /// Write a checkpoint blob from pre-merged entries. Used by the v0
    /// migration, which builds its entry set outside the epoch layout.
    pub fn write_checkpoint_from_entries(
        &self,
        epoch: u32,
        mut entries: Vec<IndexEntry>,
    ) -> StoreResult<String> {
        self.write_named_blob(epoch, CHECKPOINT_TOKEN, &mut entries)
    }

    /// Delete index blobs that have been superseded by a compaction or
    /// checkpoint blob for longer than the safety margin. Returns the number
    /// of deleted blobs.
    pub fn cleanup(&self, now: i64) -> StoreResult<usize> {
        let margin = self.params.cleanup_safety_margin_secs as i64;
        let metas = with_retry("list index blobs", &self.backoff, || self.store.list("x"))?;

        let mut compacted_epochs = Vec::new();
        let mut checkpoint_epoch = None;
        for meta in &metas {
            match parse_index_blob_name(&meta.id) {
                Some((epoch, COMPACTED_TOKEN)) => compacted_epochs.push(epoch),
                Some((epoch, CHECKPOINT_TOKEN)) => {
                    checkpoint_epoch = checkpoint_epoch.max(Some(epoch))
                }
                _ => (),
            }
        }

        let mut deleted = 0;
        for meta in &metas {
            let (epoch, token) = match parse_index_blob_name(&meta.id) {
                Some(parsed) => parsed,
                None => continue,
            };
            let superseded = match token {
                CHECKPOINT_TOKEN => checkpoint_epoch.map_or(false, |cp| epoch < cp),
                // a checkpoint at epoch N was written after N's compaction
                // and fully covers it
                COMPACTED_TOKEN => checkpoint_epoch.map_or(false, |cp| epoch <= cp),
                _ => {
                    compacted_epochs.contains(&epoch)
                        || checkpoint_epoch.map_or(false, |cp| epoch <= cp)
                }
            };
            if !superseded {
                continue;
            }
            let closed_at = match self.read_marker(epoch)? {
                Some(marker) => marker.closed_at,
                None => meta.timestamp,
            };
            if now - closed_at < margin {
                continue;
            }
            match self.store.delete(&meta.id) {
                Ok(()) | Err(StoreError::NotFound(_)) => deleted += 1,
                Err(err) => return Err(err),
            }
        }
        if deleted > 0 {
            log::info!("index cleanup removed {} superseded blobs", deleted);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::content_id::{Category, ContentId};
    use crate::pack::{PackClass, PackId};

    use packvault_tools::time::epoch_i64;

    fn test_params() -> EpochParameters {
        EpochParameters {
            min_duration_secs: 1_000_000, // effectively off
            advance_on_count: 3,
            advance_on_size: u64::MAX,
            checkpoint_frequency: 4,
            cleanup_safety_margin_secs: 0,
            max_permitted_clock_drift_secs: 300,
        }
    }

    fn manager(store: &Arc<MemoryStore>) -> EpochManager {
        let store: Arc<dyn BlobStore> = store.clone();
        EpochManager::new(store, test_params(), b"ab12", Backoff::none())
    }

    fn entry(fill: u8, timestamp: u32) -> IndexEntry {
        IndexEntry {
            id: ContentId::new(Category::Data, [fill; 32]),
            flags: 0,
            format_version: 1,
            pack_id: PackId::from_parts(PackClass::Data, [fill; 16]),
            pack_offset: 0,
            packed_length: 100,
            original_length: 100,
            timestamp,
            compression_id: 0,
            encryption_key_id: 0,
        }
    }

    #[test]
    fn blob_names_parse() {
        let name = index_blob_name(7, "ab12cd34", b"data");
        assert!(name.starts_with("x00000007_ab12cd34_"));
        assert_eq!(parse_index_blob_name(&name), Some((7, "ab12cd34")));
        assert_eq!(parse_index_blob_name("nope"), None);
        assert_eq!(parse_index_blob_name("x0001"), None);
    }

    #[test]
    fn current_epoch_starts_at_zero() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);
        assert_eq!(mgr.current_epoch().unwrap(), 0);
        assert_eq!(mgr.highest_closed_epoch().unwrap(), None);
    }

    #[test]
    fn advance_on_blob_count() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);

        for fill in 0..3u8 {
            mgr.write_index_blob(0, vec![entry(fill, 100)]).unwrap();
        }
        let closed = mgr.maybe_advance(epoch_i64()).unwrap();
        assert_eq!(closed, Some(0));
        assert_eq!(mgr.current_epoch().unwrap(), 1);

        // the compaction blob exists and preserves every entry
        let names: Vec<String> = store
            .list("x00000000_compacted_")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(names.len(), 1);

        let index = mgr.load().unwrap();
        for fill in 0..3u8 {
            assert!(index.lookup(&ContentId::new(Category::Data, [fill; 32])).is_some());
        }
    }

    #[test]
    fn no_advance_below_thresholds() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);
        mgr.write_index_blob(0, vec![entry(1, 100)]).unwrap();
        assert_eq!(mgr.maybe_advance(epoch_i64()).unwrap(), None);
        assert_eq!(mgr.current_epoch().unwrap(), 0);
    }

    #[test]
    fn lost_election_does_not_compact_twice() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);
        for fill in 0..3u8 {
            mgr.write_index_blob(0, vec![entry(fill, 100)]).unwrap();
        }
        // another writer already closed epoch 0
        let marker = serde_json::to_vec(&EpochMarker {
            epoch: 0,
            closed_at: epoch_i64(),
        })
        .unwrap();
        store.put("e00000000", &marker, &PutOptions::default()).unwrap();

        assert_eq!(mgr.maybe_advance(epoch_i64()).unwrap(), None);
        assert!(store.list("x00000000_compacted_").unwrap().is_empty());
    }

    #[test]
    fn compaction_survives_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);
        for fill in 0..3u8 {
            mgr.write_index_blob(0, vec![entry(fill, 100 + fill as u32)]).unwrap();
        }
        mgr.maybe_advance(epoch_i64()).unwrap();

        let before = mgr.load().unwrap().effective_entries();
        // margin is zero in test params, so superseded blobs go right away
        let deleted = mgr.cleanup(epoch_i64() + 1).unwrap();
        assert_eq!(deleted, 3);
        let after = mgr.load().unwrap().effective_entries();
        assert_eq!(before, after);
    }

    #[test]
    fn checkpoint_bounds_blob_count() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(&store);

        // close epochs 0..=3; frequency 4 puts a checkpoint at epoch 3
        for epoch in 0..4u32 {
            for fill in 0..3u8 {
                mgr.write_index_blob(epoch, vec![entry(epoch as u8 * 10 + fill, 100)])
                    .unwrap();
            }
            assert_eq!(mgr.maybe_advance(epoch_i64()).unwrap(), Some(epoch));
        }
        assert_eq!(store.list("x00000003_checkpoint_").unwrap().len(), 1);

        let index = mgr.load().unwrap();
        for epoch in 0..4u32 {
            for fill in 0..3u8 {
                let id = ContentId::new(Category::Data, [epoch as u8 * 10 + fill; 32]);
                assert!(index.lookup(&id).is_some(), "lost {:?}", id);
            }
        }

        // cleanup leaves the checkpoint and nothing older
        mgr.cleanup(epoch_i64() + 1).unwrap();
        let index = mgr.load().unwrap();
        assert_eq!(index.entry_count(), 12);
    }
}
