//! Wire formats
//!
//! Everything peers exchange is camelCase JSON. Only the [`Announcement`]
//! travels over gossip; every other object is a blob fetched by hash.
//!
//! | Object | Sealed with |
//! |---|---|
//! | `Announcement`, `UserManifest`, `IdentityWire`, `ActionWire` | plaintext |
//! | `CircleManifest`, `PostWire`, `ReactionWire`, files | circle key |

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::types::{ActionKind, BlobHash, CircleId, NodeId, Timestamp};

/// Serialize to JSON bytes
pub fn to_json<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Parse JSON received from a peer. Malformed input is a `ParseFailure`.
pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::ParseFailure(e.to_string()))
}

fn decode_signature(signature: &str) -> SyncResult<Vec<u8>> {
    BASE64
        .decode(signature)
        .map_err(|e| SyncError::SignatureInvalid(format!("signature is not base64: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════
// Announcement
// ═══════════════════════════════════════════════════════════════════════

/// Signed pointer to a manifest, broadcast on the publisher's topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub manifest_hash: BlobHash,
    pub version: u64,
    /// Base64 Ed25519 signature over [`Announcement::signing_bytes`]
    pub signature: String,
}

impl Announcement {
    /// `manifest_hash (utf-8 hex) || version (u64 big-endian)`
    pub fn signing_bytes(manifest_hash: &BlobHash, version: u64) -> Vec<u8> {
        let mut bytes = manifest_hash.as_str().as_bytes().to_vec();
        bytes.extend_from_slice(&version.to_be_bytes());
        bytes
    }

    pub fn sign(manifest_hash: BlobHash, version: u64, keypair: &NodeKeypair) -> Self {
        let signature = keypair.sign(&Self::signing_bytes(&manifest_hash, version));
        Self {
            manifest_hash,
            version,
            signature: BASE64.encode(signature),
        }
    }

    /// Verify against the publisher's Ed25519 public key.
    pub fn verify(&self, publisher: &NodeId) -> SyncResult<()> {
        let signature = decode_signature(&self.signature)?;
        publisher.verify(
            &Self::signing_bytes(&self.manifest_hash, self.version),
            &signature,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Manifests
// ═══════════════════════════════════════════════════════════════════════

/// Snapshot of everything a node publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserManifest {
    pub version: u64,
    pub identity_hash: BlobHash,
    /// Circle id (in the publisher's id space) -> circle manifest blob
    pub circle_manifests: BTreeMap<CircleId, BlobHash>,
    /// Recipient -> action blobs addressed to them
    pub actions: BTreeMap<NodeId, Vec<BlobHash>>,
}

/// Entry for one post in a circle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEntry {
    pub hash: BlobHash,
    pub timestamp: Timestamp,
    pub author_node_id: NodeId,
}

/// Index of one circle's content, sealed with the circle key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleManifest {
    pub name: String,
    pub posts: Vec<PostEntry>,
    pub members: Vec<NodeId>,
    /// Reaction blobs; absent in manifests from older publishers
    #[serde(default)]
    pub reactions: Vec<BlobHash>,
}

// ═══════════════════════════════════════════════════════════════════════
// Content objects
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionWire {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub data: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circle_id: Option<CircleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityWire {
    pub name: String,
    #[serde(default)]
    pub profile_pic_hash: Option<BlobHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWire {
    pub mime_type: String,
    pub blob_hash: BlobHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostWire {
    pub timestamp: Timestamp,
    #[serde(default)]
    pub parent_hash: Option<BlobHash>,
    pub text: String,
    pub files: Vec<FileWire>,
    pub signature: String,
}

impl PostWire {
    /// Canonical bytes an author signs: timestamp, parent, text, author.
    pub fn signing_bytes(
        timestamp: Timestamp,
        parent_hash: Option<&BlobHash>,
        text: &str,
        author: &NodeId,
    ) -> Vec<u8> {
        let mut bytes = b"circlesync-post-v1".to_vec();
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes.extend_from_slice(parent_hash.map(|h| h.as_str()).unwrap_or("").as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(author.as_bytes());
        bytes.extend_from_slice(text.as_bytes());
        bytes
    }

    pub fn sign_fields(
        timestamp: Timestamp,
        parent_hash: Option<&BlobHash>,
        text: &str,
        keypair: &NodeKeypair,
    ) -> String {
        let bytes = Self::signing_bytes(timestamp, parent_hash, text, &keypair.node_id());
        BASE64.encode(keypair.sign(&bytes))
    }

    pub fn verify(&self, author: &NodeId) -> SyncResult<()> {
        let signature = decode_signature(&self.signature)?;
        let bytes = Self::signing_bytes(self.timestamp, self.parent_hash.as_ref(), &self.text, author);
        author.verify(&bytes, &signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionWire {
    pub post_hash: BlobHash,
    pub author_node_id: NodeId,
    pub emoji: String,
    pub timestamp: Timestamp,
    pub signature: String,
    pub is_removal: bool,
}

impl ReactionWire {
    /// Canonical bytes an author signs. Removal is covered so a tombstone
    /// cannot be forged from an insert.
    pub fn signing_bytes(
        post_hash: &BlobHash,
        author: &NodeId,
        emoji: &str,
        timestamp: Timestamp,
        is_removal: bool,
    ) -> Vec<u8> {
        let mut bytes = b"circlesync-reaction-v1".to_vec();
        bytes.extend_from_slice(post_hash.as_str().as_bytes());
        bytes.extend_from_slice(author.as_bytes());
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes.push(is_removal as u8);
        bytes.extend_from_slice(emoji.as_bytes());
        bytes
    }

    pub fn signed(
        post_hash: BlobHash,
        emoji: String,
        timestamp: Timestamp,
        is_removal: bool,
        keypair: &NodeKeypair,
    ) -> Self {
        let author = keypair.node_id();
        let bytes = Self::signing_bytes(&post_hash, &author, &emoji, timestamp, is_removal);
        Self {
            post_hash,
            author_node_id: author,
            emoji,
            timestamp,
            signature: BASE64.encode(keypair.sign(&bytes)),
            is_removal,
        }
    }

    pub fn verify(&self) -> SyncResult<()> {
        let signature = decode_signature(&self.signature)?;
        let bytes = Self::signing_bytes(
            &self.post_hash,
            &self.author_node_id,
            &self.emoji,
            self.timestamp,
            self.is_removal,
        );
        self.author_node_id.verify(&bytes, &signature)
    }
}
