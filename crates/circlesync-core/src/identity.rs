//! Node keypair
//!
//! Every node owns one Ed25519 signing key. Everything else is derived from it:
//!
//! ```text
//! node id        = Ed25519 public key (also the iroh endpoint id)
//! x25519 secret  = clamped Ed25519 scalar          (key wrapping)
//! x25519 public  = Montgomery form of the node id  (key wrapping)
//! storage key    = BLAKE3-derive("circlesync-keystore-v1", seed)
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{SyncError, SyncResult};
use crate::types::NodeId;

/// Derivation context for the key that seals key material at rest.
const STORAGE_KEY_CONTEXT: &str = "circlesync-keystore-v1";

/// The local node's signing identity.
pub struct NodeKeypair {
    signing: SigningKey,
}

impl NodeKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Seed bytes for persistence
    pub fn to_seed_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message with the node's Ed25519 key
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Static X25519 secret used for key agreement
    pub fn x25519_secret(&self) -> X25519StaticSecret {
        X25519StaticSecret::from(self.signing.to_scalar_bytes())
    }

    /// Symmetric key that seals locally stored key material
    pub fn storage_key(&self) -> [u8; 32] {
        blake3::derive_key(STORAGE_KEY_CONTEXT, &self.signing.to_bytes())
    }

    /// Secret key for the iroh endpoint; the endpoint id equals [`Self::node_id`]
    pub fn iroh_secret_key(&self) -> iroh::SecretKey {
        iroh::SecretKey::from_bytes(&self.signing.to_bytes())
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

impl NodeId {
    /// Verify an Ed25519 signature made by this node
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> SyncResult<()> {
        let key = VerifyingKey::from_bytes(self.as_bytes())
            .map_err(|e| SyncError::SignatureInvalid(format!("bad public key: {}", e)))?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            SyncError::SignatureInvalid(format!("signature must be 64 bytes, got {}", signature.len()))
        })?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|e| SyncError::SignatureInvalid(e.to_string()))
    }

    /// X25519 public key of this node, for key agreement
    pub fn x25519_public(&self) -> SyncResult<X25519PublicKey> {
        let key = VerifyingKey::from_bytes(self.as_bytes())
            .map_err(|e| SyncError::Crypto(format!("invalid node public key: {}", e)))?;
        Ok(X25519PublicKey::from(key.to_montgomery().to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_roundtrip() {
        let keypair = NodeKeypair::generate();
        let restored = NodeKeypair::from_seed(&keypair.to_seed_bytes());
        assert_eq!(keypair.node_id(), restored.node_id());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = NodeKeypair::generate();
        let sig = keypair.sign(b"manifest");
        assert!(keypair.node_id().verify(b"manifest", &sig).is_ok());
        assert!(keypair.node_id().verify(b"tampered", &sig).is_err());

        let other = NodeKeypair::generate();
        assert!(other.node_id().verify(b"manifest", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let keypair = NodeKeypair::generate();
        let err = keypair.node_id().verify(b"m", &[0u8; 10]).unwrap_err();
        assert!(matches!(err, SyncError::SignatureInvalid(_)));
    }

    #[test]
    fn test_x25519_agreement_is_symmetric() {
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();

        let ab = alice
            .x25519_secret()
            .diffie_hellman(&bob.node_id().x25519_public().unwrap());
        let ba = bob
            .x25519_secret()
            .diffie_hellman(&alice.node_id().x25519_public().unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_iroh_key_matches_node_id() {
        let keypair = NodeKeypair::generate();
        let iroh_key = keypair.iroh_secret_key();
        assert_eq!(iroh_key.public().as_bytes(), keypair.node_id().as_bytes());
    }

    #[test]
    fn test_storage_key_is_stable() {
        let keypair = NodeKeypair::generate();
        assert_eq!(keypair.storage_key(), keypair.storage_key());
        assert_ne!(keypair.storage_key(), NodeKeypair::generate().storage_key());
    }
}
