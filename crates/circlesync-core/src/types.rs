//! Core types for CircleSync
//!
//! Identifiers shared by every layer: node ids (Ed25519 public keys), blob
//! hashes (BLAKE3 of stored bytes) and gossip topic keys. Row types live in the
//! submodules and are re-exported here.

pub mod action;
pub mod content;
pub mod peer;

pub use action::{ActionKind, InboundAction, OutboundAction};
pub use content::{Circle, FileRef, Identity, Post, Reaction, UNKNOWN_DISPLAY_NAME};
pub use peer::{LocalSyncState, PeerTopic, StoredAnnouncement};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Local row id of an [`Identity`].
pub type IdentityId = u64;

/// Local row id of a [`Circle`]. Circle ids are scoped to the owning node.
pub type CircleId = u64;

/// Local row id of a [`Post`].
pub type PostId = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ═══════════════════════════════════════════════════════════════════════
// NodeId
// ═══════════════════════════════════════════════════════════════════════

/// A node's Ed25519 public key.
///
/// The same 32 bytes are the iroh endpoint id, so a node id doubles as the
/// dial address hint for gossip bootstrap and blob downloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Create a NodeId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, the form used on the wire and as key subjects
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> SyncResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| SyncError::InvalidOperation(format!("invalid node id: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SyncError::InvalidOperation(format!("node id must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(arr))
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// BlobHash
// ═══════════════════════════════════════════════════════════════════════

/// Content address of a stored blob: lowercase hex BLAKE3 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHash(String);

impl BlobHash {
    /// Hash arbitrary bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Parse and validate a hex hash
    pub fn parse(s: &str) -> SyncResult<Self> {
        let s = s.trim().to_ascii_lowercase();
        let bytes = hex::decode(&s)
            .map_err(|e| SyncError::ParseFailure(format!("invalid blob hash: {}", e)))?;
        if bytes.len() != 32 {
            return Err(SyncError::ParseFailure(format!(
                "blob hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(s))
    }

    /// Raw 32 hash bytes
    pub fn to_bytes(&self) -> SyncResult<[u8; 32]> {
        let bytes = hex::decode(&self.0)
            .map_err(|e| SyncError::ParseFailure(format!("invalid blob hash: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| SyncError::ParseFailure("blob hash must be 32 bytes".to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobHash {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// TopicKey
// ═══════════════════════════════════════════════════════════════════════

/// Domain separation prefix for per-node announcement topics.
const NODE_TOPIC_PREFIX: &[u8] = b"circlesync-node-topic-v1:";

/// Gossip topic a node announces its manifests on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicKey(pub [u8; 32]);

impl TopicKey {
    /// Derive the announcement topic owned by `node`.
    ///
    /// ```text
    /// topic = BLAKE3("circlesync-node-topic-v1:" || node_id_hex)
    /// ```
    pub fn for_node(node: &NodeId) -> Self {
        let hex = node.to_hex();
        let mut input = Vec::with_capacity(NODE_TOPIC_PREFIX.len() + hex.len());
        input.extend_from_slice(NODE_TOPIC_PREFIX);
        input.extend_from_slice(hex.as_bytes());
        Self(*blake3::hash(&input).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> SyncResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| SyncError::InvalidOperation(format!("invalid topic key: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::InvalidOperation("topic key must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }

    /// Convert to an iroh-gossip topic id
    pub fn to_topic_id(&self) -> iroh_gossip::proto::TopicId {
        iroh_gossip::proto::TopicId::from_bytes(self.0)
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({})", &self.to_hex()[..8])
    }
}

impl Serialize for TopicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TopicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::from_bytes([7u8; 32]);
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_node_id_serializes_as_string() {
        let id = NodeId::from_bytes([1u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_blob_hash_is_blake3() {
        let hash = BlobHash::of(b"hello");
        assert_eq!(hash.as_str(), blake3::hash(b"hello").to_hex().as_str());
        assert_eq!(BlobHash::parse(hash.as_str()).unwrap(), hash);
        assert!(BlobHash::parse("not-hex").is_err());
        assert!(BlobHash::parse("abcd").is_err());
    }

    #[test]
    fn test_blob_hash_parse_normalizes_case() {
        let hash = BlobHash::of(b"x");
        let upper = hash.as_str().to_uppercase();
        assert_eq!(BlobHash::parse(&upper).unwrap(), hash);
    }

    #[test]
    fn test_topic_key_is_deterministic_per_node() {
        let a = NodeId::from_bytes([1u8; 32]);
        let b = NodeId::from_bytes([2u8; 32]);
        assert_eq!(TopicKey::for_node(&a), TopicKey::for_node(&a));
        assert_ne!(TopicKey::for_node(&a), TopicKey::for_node(&b));

        let key = TopicKey::for_node(&a);
        assert_eq!(TopicKey::from_hex(&key.to_hex()).unwrap(), key);
        assert_eq!(key.to_topic_id().as_bytes(), key.as_bytes());
    }
}
