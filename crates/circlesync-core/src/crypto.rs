//! Circle content encryption
//!
//! Every circle has one symmetric key. Posts, reactions, files and circle
//! manifests are sealed with it before they become blobs.
//!
//! # Wire Format
//!
//! `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
//!
//! 32-byte keys use ChaCha20-Poly1305. 16-byte keys, as received from older
//! peers, use AES-128-GCM with the same framing.
//!
//! # Multi-candidate decryption
//!
//! Content from a peer may have been sealed under any key that peer ever gave
//! us. [`MultiCipher`] holds the candidates newest first and returns the
//! first plaintext that passes a content validator.

use aes_gcm::Aes128Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;

use crate::error::{SyncError, SyncResult};

/// Nonce size for both AEADs (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Algorithm name recorded for 32-byte keys
pub const ALGORITHM_CHACHA: &str = "ChaCha20-Poly1305";

/// Algorithm name recorded for legacy 16-byte keys
pub const ALGORITHM_AES128: &str = "AES-128-GCM";

enum CipherImpl {
    ChaCha(ChaCha20Poly1305),
    Aes128(Aes128Gcm),
}

/// Symmetric cipher for one circle key.
pub struct CircleCrypto {
    cipher: CipherImpl,
}

impl CircleCrypto {
    /// Create a cipher for a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: CipherImpl::ChaCha(ChaCha20Poly1305::new(key.into())),
        }
    }

    /// Create a cipher from raw key material of 16 or 32 bytes.
    pub fn from_key_material(key: &[u8]) -> SyncResult<Self> {
        match key.len() {
            32 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| SyncError::Crypto(format!("invalid key: {}", e)))?;
                Ok(Self {
                    cipher: CipherImpl::ChaCha(cipher),
                })
            }
            16 => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| SyncError::Crypto(format!("invalid key: {}", e)))?;
                Ok(Self {
                    cipher: CipherImpl::Aes128(cipher),
                })
            }
            n => Err(SyncError::Crypto(format!(
                "circle keys must be 16 or 32 bytes, got {}",
                n
            ))),
        }
    }

    /// Generate a new random 32-byte circle key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Algorithm name for key metadata
    pub fn algorithm(&self) -> &'static str {
        match self.cipher {
            CipherImpl::ChaCha(_) => ALGORITHM_CHACHA,
            CipherImpl::Aes128(_) => ALGORITHM_AES128,
        }
    }

    /// Encrypt with a fresh random nonce, output `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match &self.cipher {
            CipherImpl::ChaCha(c) => c.encrypt(nonce, plaintext),
            CipherImpl::Aes128(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `nonce || ciphertext`. Tag mismatch is a `DecryptFailure`.
    pub fn decrypt(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(SyncError::DecryptFailure(
                "Data too short to contain nonce".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let encrypted = &data[NONCE_SIZE..];

        match &self.cipher {
            CipherImpl::ChaCha(c) => c.decrypt(nonce, encrypted),
            CipherImpl::Aes128(c) => c.decrypt(nonce, encrypted),
        }
        .map_err(|e| SyncError::DecryptFailure(format!("Decryption failed: {}", e)))
    }
}

impl std::fmt::Debug for CircleCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircleCrypto")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// MultiCipher
// ═══════════════════════════════════════════════════════════════════════

/// One decryption attempt.
#[derive(Debug)]
pub enum Candidate {
    Key(CircleCrypto),
    /// Treat the bytes as already-plaintext
    Cleartext,
}

/// Ordered candidate decryptors with validator-based acceptance.
#[derive(Debug, Default)]
pub struct MultiCipher {
    candidates: Vec<Candidate>,
}

impl MultiCipher {
    /// Key candidates (newest first) followed by a cleartext candidate.
    pub fn new(keys: impl IntoIterator<Item = CircleCrypto>) -> Self {
        let mut candidates: Vec<Candidate> = keys.into_iter().map(Candidate::Key).collect();
        candidates.push(Candidate::Cleartext);
        Self { candidates }
    }

    /// Candidates for binary attachments.
    ///
    /// A non-empty check accepts any ciphertext as cleartext, so the cleartext
    /// candidate is only present when there is no key at all.
    pub fn for_files(keys: impl IntoIterator<Item = CircleCrypto>) -> Self {
        let candidates: Vec<Candidate> = keys.into_iter().map(Candidate::Key).collect();
        if candidates.is_empty() {
            return Self {
                candidates: vec![Candidate::Cleartext],
            };
        }
        Self { candidates }
    }

    pub fn key_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c, Candidate::Key(_)))
            .count()
    }

    pub fn has_keys(&self) -> bool {
        self.key_count() > 0
    }

    /// Try every candidate in order and return the first validated output.
    ///
    /// Fails with `ParseFailure` if some key authenticated the data but the
    /// plaintext was rejected, and with `DecryptFailure` if nothing decrypted.
    pub fn decrypt_with<T>(
        &self,
        data: &[u8],
        validate: impl Fn(&[u8]) -> Option<T>,
    ) -> SyncResult<T> {
        let mut authenticated_but_invalid = false;

        for candidate in &self.candidates {
            match candidate {
                Candidate::Key(crypto) => {
                    if let Ok(plaintext) = crypto.decrypt(data) {
                        match validate(&plaintext) {
                            Some(value) => return Ok(value),
                            None => authenticated_but_invalid = true,
                        }
                    }
                }
                Candidate::Cleartext => {
                    if let Some(value) = validate(data) {
                        return Ok(value);
                    }
                }
            }
        }

        if authenticated_but_invalid {
            Err(SyncError::ParseFailure(
                "decrypted content failed validation".to_string(),
            ))
        } else {
            Err(SyncError::DecryptFailure(format!(
                "none of {} candidates decrypted the content",
                self.candidates.len()
            )))
        }
    }

    /// Decrypt and parse JSON of the expected shape.
    pub fn decrypt_json<T: DeserializeOwned>(&self, data: &[u8]) -> SyncResult<T> {
        self.decrypt_with(data, validators::json::<T>)
    }

    /// Decrypt binary content that must not be empty.
    pub fn decrypt_binary(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        self.decrypt_with(data, validators::non_empty)
    }
}

/// Content validators for [`MultiCipher::decrypt_with`].
pub mod validators {
    use serde::de::DeserializeOwned;

    /// Accept bytes that parse as JSON of type `T`.
    pub fn json<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
        serde_json::from_slice(bytes).ok()
    }

    /// Accept any non-empty bytes.
    pub fn non_empty(bytes: &[u8]) -> Option<Vec<u8>> {
        (!bytes.is_empty()).then(|| bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Note {
        text: String,
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = CircleCrypto::generate_key();
        let crypto = CircleCrypto::new(&key);

        let ciphertext = crypto.encrypt(b"hello circle").unwrap();
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"hello circle");
        assert_eq!(ciphertext.len(), NONCE_SIZE + b"hello circle".len() + 16);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let crypto = CircleCrypto::new(&CircleCrypto::generate_key());
        let a = crypto.encrypt(b"x").unwrap();
        let b = crypto.encrypt(b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_decrypt_failure() {
        let a = CircleCrypto::new(&CircleCrypto::generate_key());
        let b = CircleCrypto::new(&CircleCrypto::generate_key());
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(matches!(
            b.decrypt(&ciphertext),
            Err(SyncError::DecryptFailure(_))
        ));
        assert!(matches!(
            a.decrypt(&[1, 2, 3]),
            Err(SyncError::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_legacy_16_byte_key() {
        let crypto = CircleCrypto::from_key_material(&[5u8; 16]).unwrap();
        assert_eq!(crypto.algorithm(), ALGORITHM_AES128);
        let ciphertext = crypto.encrypt(b"old").unwrap();
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"old");

        assert!(CircleCrypto::from_key_material(&[0u8; 24]).is_err());
        assert_eq!(
            CircleCrypto::from_key_material(&[0u8; 32]).unwrap().algorithm(),
            ALGORITHM_CHACHA
        );
    }

    #[test]
    fn test_multi_cipher_picks_matching_key() {
        let old_key = CircleCrypto::generate_key();
        let new_key = CircleCrypto::generate_key();
        let sealed_with_old = CircleCrypto::new(&old_key)
            .encrypt(br#"{"text":"hi"}"#)
            .unwrap();

        let multi = MultiCipher::new([CircleCrypto::new(&new_key), CircleCrypto::new(&old_key)]);
        let note: Note = multi.decrypt_json(&sealed_with_old).unwrap();
        assert_eq!(note.text, "hi");
    }

    #[test]
    fn test_multi_cipher_cleartext_candidate() {
        let multi = MultiCipher::new([CircleCrypto::new(&CircleCrypto::generate_key())]);
        let note: Note = multi.decrypt_json(br#"{"text":"public"}"#).unwrap();
        assert_eq!(note.text, "public");
    }

    #[test]
    fn test_multi_cipher_no_candidate_is_decrypt_failure() {
        let sealed = CircleCrypto::new(&CircleCrypto::generate_key())
            .encrypt(br#"{"text":"hi"}"#)
            .unwrap();
        let multi = MultiCipher::new([CircleCrypto::new(&CircleCrypto::generate_key())]);
        assert!(matches!(
            multi.decrypt_json::<Note>(&sealed),
            Err(SyncError::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_multi_cipher_authenticated_garbage_is_parse_failure() {
        let key = CircleCrypto::generate_key();
        let sealed = CircleCrypto::new(&key).encrypt(b"not json").unwrap();
        let multi = MultiCipher::new([CircleCrypto::new(&key)]);
        assert!(matches!(
            multi.decrypt_json::<Note>(&sealed),
            Err(SyncError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_file_cipher_has_no_cleartext_when_keyed() {
        let key = CircleCrypto::generate_key();
        let other = CircleCrypto::new(&CircleCrypto::generate_key())
            .encrypt(b"binary")
            .unwrap();
        let files = MultiCipher::for_files([CircleCrypto::new(&key)]);
        assert!(files.decrypt_binary(&other).is_err());

        let public = MultiCipher::for_files(Vec::new());
        assert_eq!(public.decrypt_binary(b"raw").unwrap(), b"raw");
        assert!(public.decrypt_binary(b"").is_err());
    }
}
