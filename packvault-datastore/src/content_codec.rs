//! The write path transform for a single content: compress, optionally add
//! Reed-Solomon shards, encrypt. The read path undoes the layers in reverse.
//!
//! The layer order is load bearing: compression and ECC run before
//! encryption, so the ciphertext of a given plaintext stays deterministic
//! (see [crate::crypt_config]). No compression framing is stored inside the
//! content bytes; the compression header id lives in the index entry.

use reed_solomon_erasure::galois_8::ReedSolomon;

use packvault_api_types::{CompressionKind, EccConfig};

use crate::crypt_config::CryptConfig;
use crate::error::{StoreError, StoreResult};
use crate::file_formats::{
    COMPRESSION_HEADER_NONE, COMPRESSION_HEADER_ZSTD, ECC_FRAME_MAGIC_1_0,
};

/// Hard upper bound on a single content plaintext. Chunk splitters stay far
/// below this; object lists are cut before they reach it.
pub const MAX_CONTENT_SIZE: usize = 64 * 1024 * 1024;

const ECC_HEADER_SIZE: usize = 4 + 2 + 2 + 4 + 4;
const ECC_TARGET_SHARD_SIZE: usize = 2048;
const ECC_MAX_DATA_SHARDS: usize = 128;

/// Result of the write-path transform, ready to append to a pack.
pub struct EncodedContent {
    pub data: Vec<u8>,
    pub compression_id: u32,
    pub ecc: bool,
    pub original_length: u32,
}

pub fn encode_content(
    crypt: &CryptConfig,
    digest: &[u8; 32],
    data: &[u8],
    compression: CompressionKind,
    ecc: Option<&EccConfig>,
) -> StoreResult<EncodedContent> {
    if data.len() > MAX_CONTENT_SIZE {
        return Err(StoreError::permanent(format!(
            "content too large ({} bytes)",
            data.len()
        )));
    }

    let compressed;
    let (compression_id, payload) = match compression {
        CompressionKind::Zstd => {
            compressed = zstd::bulk::compress(data, 1)
                .map_err(|err| StoreError::permanent(format!("compression failed - {}", err)))?;
            // only use compression if the result is shorter
            if compressed.len() < data.len() {
                (COMPRESSION_HEADER_ZSTD, &compressed[..])
            } else {
                (COMPRESSION_HEADER_NONE, data)
            }
        }
        CompressionKind::None => (COMPRESSION_HEADER_NONE, data),
    };

    let framed;
    let (has_ecc, payload) = match ecc {
        Some(config) => {
            framed = encode_ecc(payload, config.overhead_percent)?;
            (true, &framed[..])
        }
        None => (false, payload),
    };

    Ok(EncodedContent {
        data: crypt.encrypt(digest, payload)?,
        compression_id,
        ecc: has_ecc,
        original_length: data.len() as u32,
    })
}

/// Reverse of [encode_content]. The caller passes the layer information
/// recorded in the index entry; digest verification stays with the caller.
pub fn decode_content(
    crypt: &CryptConfig,
    digest: &[u8; 32],
    data: &[u8],
    compression_id: u32,
    has_ecc: bool,
) -> StoreResult<Vec<u8>> {
    let inner = match crypt.decrypt(digest, data) {
        Ok(inner) => inner,
        // The auth tag failed, but with ECC underneath the shard CRCs can
        // still prove (and repair) the plaintext.
        Err(StoreError::Corrupted(_)) if has_ecc => crypt.decrypt_unauthenticated(digest, data)?,
        Err(err) => return Err(err),
    };

    let payload = if has_ecc { decode_ecc(&inner)? } else { inner };

    match compression_id {
        COMPRESSION_HEADER_NONE => Ok(payload),
        COMPRESSION_HEADER_ZSTD => zstd::stream::decode_all(&payload[..]).map_err(|err| {
            StoreError::Corrupted(format!("content decompression failed - {}", err))
        }),
        other => Err(StoreError::permanent(format!(
            "unknown compression header id {}",
            other
        ))),
    }
}

fn ecc_shard_counts(payload_len: usize, overhead_percent: u8) -> (usize, usize, usize) {
    let data_shards = (payload_len / ECC_TARGET_SHARD_SIZE).clamp(1, ECC_MAX_DATA_SHARDS);
    let parity_shards = ((data_shards * overhead_percent as usize + 99) / 100).max(1);
    let shard_len = (payload_len + data_shards - 1) / data_shards.max(1);
    (data_shards, parity_shards, shard_len.max(1))
}

/// Shard the payload, append parity shards, and guard every shard with a
/// CRC32 so the decoder knows which shards to reconstruct.
fn encode_ecc(payload: &[u8], overhead_percent: u8) -> StoreResult<Vec<u8>> {
    let (data_shards, parity_shards, shard_len) =
        ecc_shard_counts(payload.len(), overhead_percent);

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(data_shards + parity_shards);
    for i in 0..data_shards {
        let start = (i * shard_len).min(payload.len());
        let end = ((i + 1) * shard_len).min(payload.len());
        let mut shard = payload[start..end].to_vec();
        shard.resize(shard_len, 0);
        shards.push(shard);
    }
    shards.resize(data_shards + parity_shards, vec![0u8; shard_len]);

    let rs = ReedSolomon::new(data_shards, parity_shards)
        .map_err(|err| StoreError::permanent(format!("ecc setup failed - {:?}", err)))?;
    rs.encode(&mut shards)
        .map_err(|err| StoreError::permanent(format!("ecc encode failed - {:?}", err)))?;

    let mut out =
        Vec::with_capacity(ECC_HEADER_SIZE + (data_shards + parity_shards) * (shard_len + 4));
    out.extend_from_slice(&ECC_FRAME_MAGIC_1_0);
    out.extend_from_slice(&(data_shards as u16).to_le_bytes());
    out.extend_from_slice(&(parity_shards as u16).to_le_bytes());
    out.extend_from_slice(&(shard_len as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    for shard in &shards {
        out.extend_from_slice(shard);
        out.extend_from_slice(&crc32fast::hash(shard).to_le_bytes());
    }
    Ok(out)
}

fn decode_ecc(frame: &[u8]) -> StoreResult<Vec<u8>> {
    if frame.len() < ECC_HEADER_SIZE {
        return Err(StoreError::Corrupted("ecc frame too short".to_string()));
    }
    if frame[0..4] != ECC_FRAME_MAGIC_1_0 {
        return Err(StoreError::Corrupted("bad ecc frame magic".to_string()));
    }
    let data_shards = u16::from_le_bytes(frame[4..6].try_into().unwrap()) as usize;
    let parity_shards = u16::from_le_bytes(frame[6..8].try_into().unwrap()) as usize;
    let shard_len = u32::from_le_bytes(frame[8..12].try_into().unwrap()) as usize;
    let payload_len = u32::from_le_bytes(frame[12..16].try_into().unwrap()) as usize;

    let total_shards = data_shards + parity_shards;
    let expected = ECC_HEADER_SIZE + total_shards * (shard_len + 4);
    if data_shards == 0
        || total_shards > 256
        || frame.len() != expected
        || payload_len > data_shards * shard_len
    {
        return Err(StoreError::Corrupted("bad ecc frame geometry".to_string()));
    }

    let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(total_shards);
    let mut intact = 0;
    for i in 0..total_shards {
        let start = ECC_HEADER_SIZE + i * (shard_len + 4);
        let shard = &frame[start..start + shard_len];
        let stored_crc =
            u32::from_le_bytes(frame[start + shard_len..start + shard_len + 4].try_into().unwrap());
        if crc32fast::hash(shard) == stored_crc {
            intact += 1;
            shards.push(Some(shard.to_vec()));
        } else {
            shards.push(None);
        }
    }

    if intact < data_shards {
        return Err(StoreError::Corrupted(format!(
            "ecc unrecoverable: only {} of {} shards intact",
            intact, data_shards
        )));
    }

    if shards[..data_shards].iter().any(|shard| shard.is_none()) {
        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|err| StoreError::Corrupted(format!("ecc setup failed - {:?}", err)))?;
        rs.reconstruct(&mut shards)
            .map_err(|err| StoreError::Corrupted(format!("ecc reconstruct failed - {:?}", err)))?;
    }

    let mut payload = Vec::with_capacity(data_shards * shard_len);
    for shard in shards.into_iter().take(data_shards) {
        payload.extend_from_slice(&shard.unwrap());
    }
    payload.truncate(payload_len);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypt() -> CryptConfig {
        CryptConfig::new([7u8; 32]).unwrap()
    }

    fn sample_data() -> Vec<u8> {
        // compressible but not trivial
        let mut data = Vec::new();
        for i in 0..20_000u32 {
            data.extend_from_slice(&(i / 7).to_le_bytes());
        }
        data
    }

    #[test]
    fn round_trip_plain() {
        let crypt = crypt();
        let data = sample_data();
        let digest = crypt.compute_digest(&data);
        let encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::None, None).unwrap();
        assert_eq!(encoded.compression_id, COMPRESSION_HEADER_NONE);
        assert!(!encoded.ecc);
        let decoded =
            decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, false).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn round_trip_compressed() {
        let crypt = crypt();
        let data = sample_data();
        let digest = crypt.compute_digest(&data);
        let encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::Zstd, None).unwrap();
        assert_eq!(encoded.compression_id, COMPRESSION_HEADER_ZSTD);
        assert!(encoded.data.len() < data.len());
        let decoded =
            decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, false).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn incompressible_data_stays_uncompressed() {
        let crypt = crypt();
        // high entropy via the digest function itself
        let mut data = Vec::new();
        let mut block = [0u8; 32];
        for _ in 0..64 {
            block = crypt.compute_digest(&block);
            data.extend_from_slice(&block);
        }
        let digest = crypt.compute_digest(&data);
        let encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::Zstd, None).unwrap();
        assert_eq!(encoded.compression_id, COMPRESSION_HEADER_NONE);
    }

    #[test]
    fn flipped_byte_without_ecc_is_corrupted() {
        let crypt = crypt();
        let data = sample_data();
        let digest = crypt.compute_digest(&data);
        let mut encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::Zstd, None).unwrap();
        let mid = encoded.data.len() / 2;
        encoded.data[mid] ^= 0x40;
        match decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, false) {
            Err(StoreError::Corrupted(_)) => (),
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ecc_repairs_single_flipped_byte() {
        let crypt = crypt();
        let data = sample_data();
        let digest = crypt.compute_digest(&data);
        let ecc = EccConfig {
            overhead_percent: 10,
        };
        let mut encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::Zstd, Some(&ecc)).unwrap();
        assert!(encoded.ecc);

        // flip one ciphertext byte; GCM runs in counter mode, so exactly one
        // plaintext byte (one shard) is affected
        let mid = encoded.data.len() / 3;
        encoded.data[mid] ^= 0x01;

        let decoded =
            decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, true).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn ecc_gives_up_on_heavy_damage() {
        let crypt = crypt();
        let data = sample_data();
        let digest = crypt.compute_digest(&data);
        let ecc = EccConfig {
            overhead_percent: 1,
        };
        let mut encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::None, Some(&ecc)).unwrap();

        // damage a wide stretch, far beyond what one parity shard can fix
        let start = encoded.data.len() / 4;
        let end = encoded.data.len() * 3 / 4;
        for byte in &mut encoded.data[start..end] {
            *byte ^= 0xaa;
        }

        match decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, true) {
            Err(StoreError::Corrupted(_)) => (),
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ecc_handles_tiny_payloads() {
        let crypt = crypt();
        let data = b"x".to_vec();
        let digest = crypt.compute_digest(&data);
        let ecc = EccConfig {
            overhead_percent: 20,
        };
        let encoded =
            encode_content(&crypt, &digest, &data, CompressionKind::None, Some(&ecc)).unwrap();
        let decoded =
            decode_content(&crypt, &digest, &encoded.data, encoded.compression_id, true).unwrap();
        assert_eq!(decoded, data);
    }
}
