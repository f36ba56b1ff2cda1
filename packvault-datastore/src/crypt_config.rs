//! Wrappers for the OpenSSL crypto functions.
//!
//! Contents are encrypted with AES_256_GCM. The content id is a keyed
//! HMAC-SHA256 over the plaintext, and the GCM nonce is derived from that
//! digest, so identical plaintexts produce identical ciphertexts. That
//! determinism is what makes deduplication work across writers.

use anyhow::Error;
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::symm::Cipher;

use packvault_api_types::Fingerprint;

use crate::error::{StoreError, StoreResult};

// openssl::sha::sha256(b"PackVault Encryption Key Fingerprint")
/// This constant is used to compute key fingerprints.
const FINGERPRINT_INPUT: [u8; 32] = [
    152, 82, 237, 224, 65, 67, 180, 151, 200, 42, 13, 181, 175, 103, 212, 97, 12, 157, 188, 98,
    98, 74, 173, 252, 146, 49, 158, 238, 116, 249, 228, 105,
];

/// GCM authentication tag size appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Nonce size fed into AES_256_GCM.
pub const IV_SIZE: usize = 16;

/// Encryption configuration with secret key material.
///
/// Derives two sub keys from the master key with pbkdf2_hmac: the id key
/// (content digest name space) and the iv key (deterministic nonces). The
/// master key itself is the cipher key.
pub struct CryptConfig {
    cipher: Cipher,
    id_pkey: PKey<Private>,
    iv_pkey: PKey<Private>,
    enc_key: [u8; 32],
}

impl CryptConfig {
    pub fn new(enc_key: [u8; 32]) -> Result<Self, Error> {
        let mut id_key = [0u8; 32];
        let mut iv_key = [0u8; 32];

        pbkdf2_hmac(&enc_key, b"_id_key", 10, MessageDigest::sha256(), &mut id_key)?;
        pbkdf2_hmac(&enc_key, b"_iv_key", 10, MessageDigest::sha256(), &mut iv_key)?;

        let id_pkey = PKey::hmac(&id_key)?;
        let iv_pkey = PKey::hmac(&iv_key)?;

        Ok(Self {
            cipher: Cipher::aes_256_gcm(),
            id_pkey,
            iv_pkey,
            enc_key,
        })
    }

    fn hmac(&self, pkey: &PKey<Private>, data: &[u8]) -> Result<[u8; 32], Error> {
        let mut signer = Signer::new(MessageDigest::sha256(), pkey)?;
        signer.update(data)?;
        let mut out = [0u8; 32];
        signer.sign(&mut out)?;
        Ok(out)
    }

    /// Compute a content digest in the secret id name space.
    ///
    /// Digests computed with different master keys never clash, and the
    /// plaintext cannot be brute forced from the digest.
    pub fn compute_digest(&self, data: &[u8]) -> [u8; 32] {
        // HMAC over fixed-size key material cannot fail
        self.hmac(&self.id_pkey, data).unwrap()
    }

    /// Derive the deterministic GCM nonce for a content digest.
    fn derive_iv(&self, digest: &[u8; 32]) -> [u8; IV_SIZE] {
        let full = self.hmac(&self.iv_pkey, digest).unwrap();
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&full[..IV_SIZE]);
        iv
    }

    /// Authenticated HMAC tag over arbitrary data (manifest signatures).
    pub fn compute_auth_tag(&self, data: &[u8]) -> [u8; 32] {
        self.hmac(&self.id_pkey, data).unwrap()
    }

    /// Computes a fingerprint for the secret key, safe to store in plain.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.compute_digest(&FINGERPRINT_INPUT))
    }

    /// Encrypt `data` under the nonce derived from `digest`. The 16 byte GCM
    /// tag is appended to the ciphertext.
    pub fn encrypt(&self, digest: &[u8; 32], data: &[u8]) -> StoreResult<Vec<u8>> {
        let iv = self.derive_iv(digest);
        let mut tag = [0u8; TAG_SIZE];
        let mut out =
            openssl::symm::encrypt_aead(self.cipher, &self.enc_key, Some(&iv), b"", data, &mut tag)
                .map_err(|err| StoreError::permanent(format!("encryption failed - {}", err)))?;
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt and authenticate. A mismatched tag means the stored bytes were
    /// altered and surfaces as [StoreError::Corrupted].
    pub fn decrypt(&self, digest: &[u8; 32], data: &[u8]) -> StoreResult<Vec<u8>> {
        if data.len() < TAG_SIZE {
            return Err(StoreError::Corrupted(format!(
                "encrypted content too short ({} bytes)",
                data.len()
            )));
        }
        let iv = self.derive_iv(digest);
        let (ciphertext, tag) = data.split_at(data.len() - TAG_SIZE);
        openssl::symm::decrypt_aead(self.cipher, &self.enc_key, Some(&iv), b"", ciphertext, tag)
            .map_err(|_| {
                StoreError::Corrupted("content authentication failed on decrypt".to_string())
            })
    }

    /// Decrypt without verifying the authentication tag.
    ///
    /// Only used as the recovery path for ECC protected contents: when the
    /// tag check fails, the Reed-Solomon layer underneath may still be able
    /// to repair the plaintext, and its shard CRCs decide success.
    pub fn decrypt_unauthenticated(&self, digest: &[u8; 32], data: &[u8]) -> StoreResult<Vec<u8>> {
        if data.len() < TAG_SIZE {
            return Err(StoreError::Corrupted(format!(
                "encrypted content too short ({} bytes)",
                data.len()
            )));
        }
        let iv = self.derive_iv(digest);
        let ciphertext = &data[..data.len() - TAG_SIZE];

        let mut crypter = openssl::symm::Crypter::new(
            self.cipher,
            openssl::symm::Mode::Decrypt,
            &self.enc_key,
            Some(&iv),
        )
        .map_err(|err| StoreError::permanent(format!("cipher setup failed - {}", err)))?;
        crypter
            .aad_update(b"")
            .map_err(|err| StoreError::permanent(format!("cipher setup failed - {}", err)))?;

        let mut out = vec![0u8; ciphertext.len() + self.cipher.block_size()];
        let count = crypter
            .update(ciphertext, &mut out)
            .map_err(|_| StoreError::Corrupted("unauthenticated decrypt failed".to_string()))?;
        out.truncate(count);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CryptConfig {
        CryptConfig::new([11u8; 32]).unwrap()
    }

    #[test]
    fn digest_is_keyed_and_deterministic() {
        let config = test_config();
        let other = CryptConfig::new([12u8; 32]).unwrap();

        let d1 = config.compute_digest(b"hello");
        let d2 = config.compute_digest(b"hello");
        assert_eq!(d1, d2);
        assert_ne!(d1, other.compute_digest(b"hello"));
        assert_ne!(d1, config.compute_digest(b"hello!"));
    }

    #[test]
    fn encryption_is_deterministic() {
        let config = test_config();
        let digest = config.compute_digest(b"some chunk");
        let c1 = config.encrypt(&digest, b"some chunk").unwrap();
        let c2 = config.encrypt(&digest, b"some chunk").unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), b"some chunk".len() + TAG_SIZE);
    }

    #[test]
    fn round_trip() {
        let config = test_config();
        let data = vec![42u8; 4096];
        let digest = config.compute_digest(&data);
        let encrypted = config.encrypt(&digest, &data).unwrap();
        assert_ne!(&encrypted[..data.len()], &data[..]);
        let decrypted = config.decrypt(&digest, &encrypted).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn flipped_bit_is_detected() {
        let config = test_config();
        let digest = config.compute_digest(b"payload");
        let mut encrypted = config.encrypt(&digest, b"payload").unwrap();
        encrypted[3] ^= 0x01;
        match config.decrypt(&digest, &encrypted) {
            Err(StoreError::Corrupted(_)) => (),
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fingerprints_differ_per_key() {
        let a = test_config().fingerprint();
        let b = CryptConfig::new([99u8; 32]).unwrap().fingerprint();
        assert_ne!(a, b);
    }
}
