//! Local content rows: identities, circles, posts, reactions

use serde::{Deserialize, Serialize};

use super::{BlobHash, CircleId, IdentityId, NodeId, PostId, Timestamp};

/// Display name given to authors whose identity blob has not arrived yet.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// A node's public profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub owner_node_id: NodeId,
    pub display_name: String,
    pub avatar_blob_hash: Option<BlobHash>,
    /// Hash of the published identity blob; `None` until published or received
    pub self_blob_hash: Option<BlobHash>,
}

impl Identity {
    /// A row to be inserted; the store assigns `id`.
    pub fn new(owner_node_id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            owner_node_id,
            display_name: display_name.into(),
            avatar_blob_hash: None,
            self_blob_hash: None,
        }
    }

    /// Placeholder for an author seen before their identity blob.
    pub fn placeholder(owner_node_id: NodeId) -> Self {
        Self::new(owner_node_id, UNKNOWN_DISPLAY_NAME)
    }

    pub fn is_placeholder(&self) -> bool {
        self.self_blob_hash.is_none() && self.display_name == UNKNOWN_DISPLAY_NAME
    }
}

/// An access-scoped group with one active symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    pub id: CircleId,
    pub name: String,
    pub owner_identity_id: IdentityId,
    /// Hash of the latest published circle manifest; cleared when content changes
    pub manifest_blob_hash: Option<BlobHash>,
    /// The default circle every introduced peer joins. Cannot be deleted.
    pub is_everyone: bool,
}

impl Circle {
    pub fn new(name: impl Into<String>, owner_identity_id: IdentityId) -> Self {
        Self {
            id: 0,
            name: name.into(),
            owner_identity_id,
            manifest_blob_hash: None,
            is_everyone: false,
        }
    }

    pub fn everyone(owner_identity_id: IdentityId) -> Self {
        Self {
            is_everyone: true,
            ..Self::new("Everyone", owner_identity_id)
        }
    }
}

/// A file attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub mime_type: String,
    /// Hash of the encrypted blob as published
    pub blob_hash: Option<BlobHash>,
    /// Hash of the plaintext bytes in the local blob store, once available
    pub local_hash: Option<BlobHash>,
}

impl FileRef {
    /// A local attachment whose plaintext is already in the blob store
    pub fn local(mime_type: impl Into<String>, local_hash: BlobHash) -> Self {
        Self {
            mime_type: mime_type.into(),
            blob_hash: None,
            local_hash: Some(local_hash),
        }
    }

    /// A remote attachment known only by its encrypted hash
    pub fn remote(mime_type: impl Into<String>, blob_hash: BlobHash) -> Self {
        Self {
            mime_type: mime_type.into(),
            blob_hash: Some(blob_hash),
            local_hash: None,
        }
    }
}

/// A post. Immutable once `blob_hash` is set; edits are new posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_identity_id: IdentityId,
    pub blob_hash: Option<BlobHash>,
    pub timestamp: Timestamp,
    /// Blob hash of the post this replies to
    pub parent_hash: Option<BlobHash>,
    pub text: String,
    /// Base64 Ed25519 signature over the canonical post fields
    pub signature: String,
    pub files: Vec<FileRef>,
    /// Circle in the author's id space
    pub circle_id: Option<CircleId>,
}

/// A reaction to a post, keyed by `(post_hash, author_node_id, emoji)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: u64,
    pub post_hash: BlobHash,
    pub author_node_id: NodeId,
    pub emoji: String,
    pub timestamp: Timestamp,
    pub signature: String,
    pub blob_hash: Option<BlobHash>,
    pub circle_id: Option<CircleId>,
    /// Local tombstone awaiting publication; hidden from listings
    pub removed: bool,
}

impl Reaction {
    /// Natural key used for tombstone matching
    pub fn key(&self) -> (BlobHash, NodeId, String) {
        (
            self.post_hash.clone(),
            self.author_node_id,
            self.emoji.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_identity() {
        let node = NodeId::from_bytes([3u8; 32]);
        let identity = Identity::placeholder(node);
        assert_eq!(identity.display_name, UNKNOWN_DISPLAY_NAME);
        assert!(identity.is_placeholder());

        let named = Identity::new(node, "Alice");
        assert!(!named.is_placeholder());
    }

    #[test]
    fn test_everyone_circle_flag() {
        let circle = Circle::everyone(1);
        assert!(circle.is_everyone);
        assert!(!Circle::new("Friends", 1).is_everyone);
    }
}
