//! Per-peer subscription state and the local node's publish state

use serde::{Deserialize, Serialize};

use super::{BlobHash, NodeId, Timestamp, TopicKey};

/// Subscription and sync progress for one introduced peer.
///
/// This row is the version gate: announcements at or below
/// `last_known_version` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTopic {
    pub peer_node_id: NodeId,
    pub topic_key: TopicKey,
    /// Verifying key for announcements. Equal to the node id bytes.
    pub ed25519_public_key: [u8; 32],
    /// Socket addresses used as dial hints
    pub addresses: Vec<String>,
    pub relay_url: Option<String>,
    pub last_known_version: Option<u64>,
    pub last_known_manifest_hash: Option<BlobHash>,
    pub last_synced_at: Option<Timestamp>,
}

impl PeerTopic {
    /// A freshly introduced peer with no sync progress.
    pub fn new(peer_node_id: NodeId, topic_key: TopicKey) -> Self {
        Self {
            peer_node_id,
            topic_key,
            ed25519_public_key: *peer_node_id.as_bytes(),
            addresses: Vec::new(),
            relay_url: None,
            last_known_version: None,
            last_known_manifest_hash: None,
            last_synced_at: None,
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_relay_url(mut self, relay_url: Option<String>) -> Self {
        self.relay_url = relay_url;
        self
    }

    /// Whether an announcement at `version` is newer than anything applied.
    pub fn accepts_version(&self, version: u64) -> bool {
        match self.last_known_version {
            Some(last) => version > last,
            None => true,
        }
    }
}

/// The announcement most recently broadcast by this node, kept for rebroadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAnnouncement {
    pub manifest_hash: BlobHash,
    pub version: u64,
    pub signature: String,
}

/// Persistent publish state of the local node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSyncState {
    /// Version of the last signed manifest; the next one is `version + 1`
    pub version: u64,
    pub last_manifest_hash: Option<BlobHash>,
    pub last_published_at: Option<Timestamp>,
    pub last_announcement: Option<StoredAnnouncement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        let node = NodeId::from_bytes([9u8; 32]);
        let mut topic = PeerTopic::new(node, TopicKey::for_node(&node));
        assert!(topic.accepts_version(0));
        assert!(topic.accepts_version(1));

        topic.last_known_version = Some(3);
        assert!(!topic.accepts_version(2));
        assert!(!topic.accepts_version(3));
        assert!(topic.accepts_version(4));
    }

    #[test]
    fn test_new_peer_uses_node_id_as_verifying_key() {
        let node = NodeId::from_bytes([4u8; 32]);
        let topic = PeerTopic::new(node, TopicKey::for_node(&node));
        assert_eq!(&topic.ed25519_public_key, node.as_bytes());
    }
}
