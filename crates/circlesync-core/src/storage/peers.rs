//! Peer topic storage
//!
//! One row per introduced peer, keyed by node id hex. The sync-progress fields
//! only move forward through [`Storage::advance_peer_sync`].

use crate::error::SyncError;
use crate::types::{BlobHash, NodeId, PeerTopic, Timestamp};
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, Storage};

pub(crate) const PEER_TOPICS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("peer_topics");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Peer Topic Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a peer topic.
    ///
    /// Re-introducing a known peer refreshes topic and addresses but keeps its
    /// sync progress.
    pub fn save_peer_topic(&self, topic: &PeerTopic) -> Result<PeerTopic, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(PEER_TOPICS_TABLE)?;
            let key = topic.peer_node_id.to_hex();
            let existing: Option<PeerTopic> = match table.get(key.as_str())? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };

            let mut stored = topic.clone();
            if let Some(existing) = existing {
                stored.last_known_version = existing.last_known_version;
                stored.last_known_manifest_hash = existing.last_known_manifest_hash;
                stored.last_synced_at = existing.last_synced_at;
            }
            let data = encode(&stored)?;
            table.insert(key.as_str(), data.as_slice())?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn load_peer_topic(&self, peer: &NodeId) -> Result<Option<PeerTopic>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEER_TOPICS_TABLE)?;
        match table.get(peer.to_hex().as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_peer_topics(&self) -> Result<Vec<PeerTopic>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEER_TOPICS_TABLE)?;

        let mut topics = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            topics.push(decode(value.value())?);
        }
        Ok(topics)
    }

    pub fn delete_peer_topic(&self, peer: &NodeId) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PEER_TOPICS_TABLE)?;
            let existed = table.remove(peer.to_hex().as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Record a fully processed manifest.
    ///
    /// Returns `false` without writing if `version` is not newer than the stored
    /// version, so concurrent or replayed passes cannot move the gate backwards.
    pub fn advance_peer_sync(
        &self,
        peer: &NodeId,
        version: u64,
        manifest_hash: &BlobHash,
        synced_at: Timestamp,
    ) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let advanced = {
            let mut table = write_txn.open_table(PEER_TOPICS_TABLE)?;
            let key = peer.to_hex();
            let mut topic: PeerTopic = match table.get(key.as_str())? {
                Some(v) => decode(v.value())?,
                None => return Err(SyncError::UnknownPeer(peer.to_hex())),
            };
            if !topic.accepts_version(version) {
                false
            } else {
                topic.last_known_version = Some(version);
                topic.last_known_manifest_hash = Some(manifest_hash.clone());
                topic.last_synced_at = Some(synced_at);
                let data = encode(&topic)?;
                table.insert(key.as_str(), data.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::test_support::temp_storage;
    use crate::types::{BlobHash, NodeId, PeerTopic, TopicKey};

    fn peer() -> NodeId {
        NodeId::from_bytes([8u8; 32])
    }

    #[test]
    fn test_save_and_load() {
        let (storage, _dir) = temp_storage();
        let topic = PeerTopic::new(peer(), TopicKey::for_node(&peer()))
            .with_addresses(vec!["127.0.0.1:4000".to_string()]);
        storage.save_peer_topic(&topic).unwrap();

        let loaded = storage.load_peer_topic(&peer()).unwrap().unwrap();
        assert_eq!(loaded, topic);
        assert_eq!(storage.list_peer_topics().unwrap().len(), 1);
    }

    #[test]
    fn test_advance_never_goes_backwards() {
        let (storage, _dir) = temp_storage();
        storage
            .save_peer_topic(&PeerTopic::new(peer(), TopicKey::for_node(&peer())))
            .unwrap();

        let h3 = BlobHash::of(b"v3");
        assert!(storage.advance_peer_sync(&peer(), 3, &h3, 100).unwrap());
        assert!(!storage
            .advance_peer_sync(&peer(), 2, &BlobHash::of(b"v2"), 200)
            .unwrap());
        assert!(!storage
            .advance_peer_sync(&peer(), 3, &BlobHash::of(b"v3b"), 200)
            .unwrap());

        let topic = storage.load_peer_topic(&peer()).unwrap().unwrap();
        assert_eq!(topic.last_known_version, Some(3));
        assert_eq!(topic.last_known_manifest_hash, Some(h3));
        assert_eq!(topic.last_synced_at, Some(100));
    }

    #[test]
    fn test_reintroduction_keeps_progress() {
        let (storage, _dir) = temp_storage();
        storage
            .save_peer_topic(&PeerTopic::new(peer(), TopicKey::for_node(&peer())))
            .unwrap();
        storage
            .advance_peer_sync(&peer(), 4, &BlobHash::of(b"v4"), 1)
            .unwrap();

        let refreshed = PeerTopic::new(peer(), TopicKey::for_node(&peer()))
            .with_addresses(vec!["10.0.0.1:1".to_string()]);
        let stored = storage.save_peer_topic(&refreshed).unwrap();
        assert_eq!(stored.last_known_version, Some(4));
        assert_eq!(stored.addresses, vec!["10.0.0.1:1".to_string()]);
    }

    #[test]
    fn test_advance_unknown_peer_fails() {
        let (storage, _dir) = temp_storage();
        assert!(storage
            .advance_peer_sync(&peer(), 1, &BlobHash::of(b"x"), 0)
            .is_err());
    }
}
