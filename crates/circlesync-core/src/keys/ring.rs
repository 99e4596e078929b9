//! Key ring: circle keys we own and keys peers gave us
//!
//! Raw material never touches disk in the clear; every record is sealed with
//! the node's storage key. Replacing a subject's Secret key is a single redb
//! write transaction, so a concurrent reader sees either the old key or the
//! new one, never neither.

use std::fmt;

use crate::crypto::{CircleCrypto, MultiCipher};
use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::storage::{KeyRecord, KeyType, Storage};
use crate::types::{now_millis, CircleId, NodeId};

/// Who a key record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySubject {
    /// A circle this node owns: `"circle:<id>"`
    Circle(CircleId),
    /// Keys from a peer with no circle scope: `"<peer hex>"`
    Peer(NodeId),
    /// A peer's key for one of their circles: `"<peer hex>:circle:<id>"`
    PeerCircle(NodeId, CircleId),
}

impl fmt::Display for KeySubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySubject::Circle(id) => write!(f, "circle:{}", id),
            KeySubject::Peer(peer) => write!(f, "{}", peer.to_hex()),
            KeySubject::PeerCircle(peer, id) => write!(f, "{}:circle:{}", peer.to_hex(), id),
        }
    }
}

/// Metadata of a stored key, without material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    pub id: u64,
    pub subject: String,
    pub alias: String,
    pub algorithm: String,
}

impl From<&KeyRecord> for KeyHandle {
    fn from(record: &KeyRecord) -> Self {
        Self {
            id: record.id,
            subject: record.subject.clone(),
            alias: record.alias.clone(),
            algorithm: record.algorithm.clone(),
        }
    }
}

/// Sealed key store on top of [`Storage`].
#[derive(Clone)]
pub struct KeyRing {
    storage: Storage,
    sealing_key: [u8; 32],
}

impl KeyRing {
    pub fn new(storage: Storage, keypair: &NodeKeypair) -> Self {
        Self {
            storage,
            sealing_key: keypair.storage_key(),
        }
    }

    fn sealer(&self) -> CircleCrypto {
        CircleCrypto::new(&self.sealing_key)
    }

    fn seal(&self, raw: &[u8]) -> SyncResult<Vec<u8>> {
        self.sealer().encrypt(raw)
    }

    fn unseal(&self, record: &KeyRecord) -> SyncResult<Vec<u8>> {
        let sealed = record
            .material
            .as_ref()
            .ok_or_else(|| SyncError::Crypto(format!("key {} has no material", record.id)))?;
        self.sealer()
            .decrypt(sealed)
            .map_err(|e| SyncError::Crypto(format!("cannot unseal key {}: {}", record.id, e)))
    }

    fn secret_record(&self, subject: &KeySubject, raw: &[u8]) -> SyncResult<KeyRecord> {
        let algorithm = CircleCrypto::from_key_material(raw)?.algorithm();
        let created_at = now_millis();
        Ok(KeyRecord {
            id: 0,
            subject: subject.to_string(),
            alias: format!("{}@{}", subject, created_at),
            algorithm: algorithm.to_string(),
            key_type: KeyType::Secret,
            material: Some(self.seal(raw)?),
            created_at,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Circle keys (owned)
    // ═══════════════════════════════════════════════════════════════════════

    /// Generate a fresh 32-byte key for `circle`, replacing any previous one.
    pub fn generate_circle_key(&self, circle: CircleId) -> SyncResult<KeyHandle> {
        let raw = CircleCrypto::generate_key();
        let record = self.secret_record(&KeySubject::Circle(circle), &raw)?;
        let stored = self.storage.replace_secret_keys(&record)?;
        tracing::debug!(circle, key_id = stored.id, "Generated circle key");
        Ok(KeyHandle::from(&stored))
    }

    /// Replace the circle's key. Content sealed under the old key stays
    /// readable only to holders of that key.
    pub fn rotate_circle_key(&self, circle: CircleId) -> SyncResult<KeyHandle> {
        let handle = self.generate_circle_key(circle)?;
        tracing::info!(circle, key_id = handle.id, "Rotated circle key");
        Ok(handle)
    }

    /// Raw material of the newest Secret key for `circle`.
    pub fn key_for_circle(&self, circle: CircleId) -> SyncResult<Vec<u8>> {
        self.candidates(&KeySubject::Circle(circle))?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("no key for circle {}", circle)))
    }

    pub fn circle_crypto(&self, circle: CircleId) -> SyncResult<CircleCrypto> {
        CircleCrypto::from_key_material(&self.key_for_circle(circle)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer keys (received)
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a key received from `peer`, deleting every earlier Secret key
    /// for the same subject.
    pub fn store_secret_key_for_peer(
        &self,
        peer: &NodeId,
        circle: Option<CircleId>,
        raw: &[u8],
    ) -> SyncResult<KeyHandle> {
        let subject = match circle {
            Some(id) => KeySubject::PeerCircle(*peer, id),
            None => KeySubject::Peer(*peer),
        };
        let record = self.secret_record(&subject, raw)?;
        let stored = self.storage.replace_secret_keys(&record)?;
        tracing::debug!(peer = %peer.short(), ?circle, key_id = stored.id, "Stored peer key");
        Ok(KeyHandle::from(&stored))
    }

    /// Raw Secret keys of a subject, newest first.
    pub fn candidates(&self, subject: &KeySubject) -> SyncResult<Vec<Vec<u8>>> {
        self.storage
            .list_keys(&subject.to_string())?
            .iter()
            .filter(|r| r.key_type == KeyType::Secret)
            .map(|r| self.unseal(r))
            .collect()
    }

    /// Ciphers for content a peer sealed for `circle`: the circle-scoped keys
    /// first, then keys stored without a circle scope.
    pub fn peer_ciphers(&self, peer: &NodeId, circle: CircleId) -> SyncResult<Vec<CircleCrypto>> {
        let mut raw = self.candidates(&KeySubject::PeerCircle(*peer, circle))?;
        raw.extend(self.candidates(&KeySubject::Peer(*peer))?);
        raw.iter()
            .map(|k| CircleCrypto::from_key_material(k))
            .collect()
    }

    /// Decryptor for structured content from `peer` in `circle`.
    pub fn decryptor_for(&self, peer: &NodeId, circle: CircleId) -> SyncResult<MultiCipher> {
        Ok(MultiCipher::new(self.peer_ciphers(peer, circle)?))
    }

    /// Decryptor for attachments from `peer` in `circle`.
    pub fn file_decryptor_for(&self, peer: &NodeId, circle: CircleId) -> SyncResult<MultiCipher> {
        Ok(MultiCipher::for_files(self.peer_ciphers(peer, circle)?))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Public keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a peer's Ed25519 public key. Public keys are never sealed.
    pub fn store_public_key(&self, peer: &NodeId) -> SyncResult<KeyHandle> {
        let subject = KeySubject::Peer(*peer);
        let existing = self
            .storage
            .list_keys(&subject.to_string())?
            .into_iter()
            .find(|r| r.key_type == KeyType::Public && r.material.as_deref() == Some(peer.as_bytes()));
        if let Some(record) = existing {
            return Ok(KeyHandle::from(&record));
        }

        let record = KeyRecord {
            id: 0,
            subject: subject.to_string(),
            alias: format!("{}-ed25519", peer.short()),
            algorithm: "Ed25519".to_string(),
            key_type: KeyType::Public,
            material: Some(peer.as_bytes().to_vec()),
            created_at: now_millis(),
        };
        let stored = self.storage.insert_key(&record)?;
        Ok(KeyHandle::from(&stored))
    }

    /// The peer's recorded Ed25519 public key, if any.
    pub fn public_key_for(&self, peer: &NodeId) -> SyncResult<Option<[u8; 32]>> {
        let record = self
            .storage
            .list_keys(&KeySubject::Peer(*peer).to_string())?
            .into_iter()
            .find(|r| r.key_type == KeyType::Public);
        Ok(record
            .and_then(|r| r.material)
            .and_then(|m| <[u8; 32]>::try_from(m.as_slice()).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_storage;

    fn ring() -> (KeyRing, NodeKeypair, tempfile::TempDir) {
        let (storage, dir) = temp_storage();
        let keypair = NodeKeypair::generate();
        (KeyRing::new(storage, &keypair), keypair, dir)
    }

    #[test]
    fn test_subject_strings() {
        let peer = NodeId::from_bytes([0xab; 32]);
        assert_eq!(KeySubject::Circle(5).to_string(), "circle:5");
        assert_eq!(KeySubject::Peer(peer).to_string(), peer.to_hex());
        assert_eq!(
            KeySubject::PeerCircle(peer, 5).to_string(),
            format!("{}:circle:5", peer.to_hex())
        );
    }

    #[test]
    fn test_circle_key_not_found() {
        let (ring, _kp, _dir) = ring();
        assert!(matches!(ring.key_for_circle(1), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_rotation_leaves_one_key() {
        let (ring, _kp, _dir) = ring();
        ring.generate_circle_key(1).unwrap();
        let first = ring.key_for_circle(1).unwrap();
        ring.rotate_circle_key(1).unwrap();
        let second = ring.key_for_circle(1).unwrap();

        assert_ne!(first, second);
        assert_eq!(ring.candidates(&KeySubject::Circle(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_material_is_sealed_at_rest() {
        let (storage, _dir) = temp_storage();
        let keypair = NodeKeypair::generate();
        let ring = KeyRing::new(storage.clone(), &keypair);
        ring.generate_circle_key(3).unwrap();
        let raw = ring.key_for_circle(3).unwrap();

        let record = &storage.list_keys("circle:3").unwrap()[0];
        let sealed = record.material.as_ref().unwrap();
        assert_ne!(sealed, &raw);
        assert!(!sealed.windows(raw.len()).any(|w| w == raw.as_slice()));

        let other = KeyRing::new(storage, &NodeKeypair::generate());
        assert!(other.key_for_circle(3).is_err());
    }

    #[test]
    fn test_peer_candidates_order() {
        let (ring, _kp, _dir) = ring();
        let peer = NodeId::from_bytes([1u8; 32]);
        ring.store_secret_key_for_peer(&peer, None, &[1u8; 32]).unwrap();
        ring.store_secret_key_for_peer(&peer, Some(7), &[2u8; 16]).unwrap();

        let ciphers = ring.peer_ciphers(&peer, 7).unwrap();
        assert_eq!(ciphers.len(), 2);
        assert_eq!(ciphers[0].algorithm(), crate::crypto::ALGORITHM_AES128);
        assert_eq!(ring.peer_ciphers(&peer, 8).unwrap().len(), 1);
    }

    #[test]
    fn test_public_key_survives_secret_replacement() {
        let (ring, _kp, _dir) = ring();
        let peer = NodeKeypair::generate().node_id();
        ring.store_public_key(&peer).unwrap();
        ring.store_public_key(&peer).unwrap();
        ring.store_secret_key_for_peer(&peer, None, &[1u8; 32]).unwrap();
        ring.store_secret_key_for_peer(&peer, None, &[2u8; 32]).unwrap();

        assert_eq!(ring.public_key_for(&peer).unwrap(), Some(*peer.as_bytes()));
        assert_eq!(
            ring.candidates(&KeySubject::Peer(peer)).unwrap(),
            vec![vec![2u8; 32]]
        );
    }
}
