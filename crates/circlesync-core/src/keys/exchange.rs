//! Circle key wrapping between two nodes
//!
//! ```text
//! shared   = X25519(my_static_secret, peer_static_public)
//! wrap_key = HKDF-SHA256(salt = CONTEXT, ikm = shared, info = CONTEXT)
//! payload  = base64(nonce || ChaCha20-Poly1305(wrap_key, raw_key, aad = CONTEXT))
//! ```
//!
//! Both static keys come from the parties' Ed25519 identity keys, so no extra
//! key material has to be exchanged. The payload is the `data` of an
//! `UpdateKey` action.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::crypto::NONCE_SIZE;
use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::types::NodeId;

/// Versioned context string for every wrapped key. Changing it breaks
/// interoperability; bump the version suffix instead.
pub const KEY_EXCHANGE_CONTEXT: &[u8] = b"circle-key-exchange-v1";

/// Poly1305 tag size
const TAG_SIZE: usize = 16;

/// Where an unwrapped key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Authenticated wrapped payload
    Wrapped,
    /// Plain base64 key from an older sender
    LegacyPlain,
}

/// Result of [`unwrap_key_from_peer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedKey {
    pub key: Vec<u8>,
    pub source: KeySource,
}

fn is_valid_key_len(len: usize) -> bool {
    len == 16 || len == 32
}

fn wrapping_cipher(me: &NodeKeypair, peer: &NodeId) -> SyncResult<ChaCha20Poly1305> {
    let shared = me.x25519_secret().diffie_hellman(&peer.x25519_public()?);
    if !shared.was_contributory() {
        return Err(SyncError::Crypto(
            "key agreement produced a non-contributory secret".to_string(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(Some(KEY_EXCHANGE_CONTEXT), shared.as_bytes());
    let mut wrap_key = [0u8; 32];
    hk.expand(KEY_EXCHANGE_CONTEXT, &mut wrap_key)
        .map_err(|e| SyncError::Crypto(format!("HKDF expand failed: {}", e)))?;

    Ok(ChaCha20Poly1305::new((&wrap_key).into()))
}

/// Wrap a 16- or 32-byte circle key for `peer`.
pub fn wrap_key_for_peer(raw_key: &[u8], me: &NodeKeypair, peer: &NodeId) -> SyncResult<String> {
    if !is_valid_key_len(raw_key.len()) {
        return Err(SyncError::Crypto(format!(
            "circle keys must be 16 or 32 bytes, got {}",
            raw_key.len()
        )));
    }
    let cipher = wrapping_cipher(me, peer)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: raw_key,
                aad: KEY_EXCHANGE_CONTEXT,
            },
        )
        .map_err(|e| SyncError::Crypto(format!("key wrap failed: {}", e)))?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Unwrap a key sent by `peer`.
///
/// Falls back to reading the payload as a plain base64 key, accepted only when
/// it decodes to exactly 16 or 32 bytes. Anything else is a `DecryptFailure`.
pub fn unwrap_key_from_peer(
    payload: &str,
    me: &NodeKeypair,
    peer: &NodeId,
) -> SyncResult<UnwrappedKey> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| SyncError::DecryptFailure(format!("key payload is not base64: {}", e)))?;

    if bytes.len() > NONCE_SIZE + TAG_SIZE {
        let cipher = wrapping_cipher(me, peer)?;
        let opened = cipher.decrypt(
            Nonce::from_slice(&bytes[..NONCE_SIZE]),
            Payload {
                msg: &bytes[NONCE_SIZE..],
                aad: KEY_EXCHANGE_CONTEXT,
            },
        );
        if let Ok(key) = opened {
            if is_valid_key_len(key.len()) {
                return Ok(UnwrappedKey {
                    key,
                    source: KeySource::Wrapped,
                });
            }
        }
    }

    if is_valid_key_len(bytes.len()) {
        tracing::debug!(peer = %peer.short(), len = bytes.len(), "Accepted legacy plain circle key");
        return Ok(UnwrappedKey {
            key: bytes,
            source: KeySource::LegacyPlain,
        });
    }

    Err(SyncError::DecryptFailure(format!(
        "key payload from {} is neither a wrapped key nor a 16/32-byte legacy key",
        peer.short()
    )))
}
