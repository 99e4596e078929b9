//! Action storage
//!
//! - `outbound_actions`: actions this node queued for peers, keyed by id
//! - `inbound_actions`: actions received from peers, keyed by blob hash

use crate::error::SyncError;
use crate::types::{ActionKind, BlobHash, CircleId, InboundAction, NodeId, OutboundAction, Timestamp};
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, next_id, Storage};

pub(crate) const OUTBOUND_ACTIONS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("outbound_actions");

pub(crate) const INBOUND_ACTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("inbound_actions");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Outbound Actions
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue an action for its recipient.
    ///
    /// A new `UpdateKey` retires earlier `UpdateKey`s for the same recipient
    /// and circle in the same transaction, so a manifest never lists two
    /// competing keys.
    pub fn queue_action(&self, action: &OutboundAction) -> Result<OutboundAction, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut stored = action.clone();
            stored.id = next_id(&write_txn, "outbound_actions")?;
            let mut table = write_txn.open_table(OUTBOUND_ACTIONS_TABLE)?;

            if stored.kind == ActionKind::UpdateKey {
                let mut superseded = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    let existing: OutboundAction = decode(value.value())?;
                    if existing.kind == ActionKind::UpdateKey
                        && !existing.retired
                        && existing.recipient == stored.recipient
                        && existing.circle_id == stored.circle_id
                    {
                        superseded.push(existing);
                    }
                }
                for mut old in superseded {
                    old.retired = true;
                    let data = encode(&old)?;
                    table.insert(old.id, data.as_slice())?;
                }
            }

            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn update_outbound_action(&self, action: &OutboundAction) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOUND_ACTIONS_TABLE)?;
            let data = encode(action)?;
            table.insert(action.id, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_outbound_actions(&self) -> Result<Vec<OutboundAction>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OUTBOUND_ACTIONS_TABLE)?;

        let mut actions = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            actions.push(decode(value.value())?);
        }
        Ok(actions)
    }

    /// Live actions whose blob has not been stored yet.
    pub fn list_unpublished_actions(&self) -> Result<Vec<OutboundAction>, SyncError> {
        Ok(self
            .list_outbound_actions()?
            .into_iter()
            .filter(|a| a.is_live() && !a.is_published())
            .collect())
    }

    /// Live, published actions: the ones a manifest lists.
    pub fn list_manifest_actions(&self) -> Result<Vec<OutboundAction>, SyncError> {
        Ok(self
            .list_outbound_actions()?
            .into_iter()
            .filter(|a| a.is_live() && a.is_published())
            .collect())
    }

    /// Mark expiring actions published at or before `cutoff` as synced.
    /// Returns how many stopped being listed.
    pub fn mark_actions_synced(&self, cutoff: Timestamp) -> Result<usize, SyncError> {
        self.rewrite_outbound(|action| {
            let due = action.is_live()
                && action.expires()
                && action.published_at.is_some_and(|at| at <= cutoff);
            if due {
                action.synced = true;
            }
            due
        })
    }

    /// Retire the live key actions for `circle`, for one recipient or all.
    pub fn retire_key_actions(
        &self,
        circle: CircleId,
        recipient: Option<&NodeId>,
    ) -> Result<usize, SyncError> {
        self.rewrite_outbound(|action| {
            let revoked = action.kind == ActionKind::UpdateKey
                && !action.retired
                && action.circle_id == Some(circle)
                && recipient.map_or(true, |r| action.recipient == *r);
            if revoked {
                action.retired = true;
            }
            revoked
        })
    }

    /// Apply `change` to every outbound action in one write transaction,
    /// storing the rows it reports as changed.
    fn rewrite_outbound(
        &self,
        mut change: impl FnMut(&mut OutboundAction) -> bool,
    ) -> Result<usize, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(OUTBOUND_ACTIONS_TABLE)?;
            let mut changed = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let mut action: OutboundAction = decode(value.value())?;
                if change(&mut action) {
                    changed.push(action);
                }
            }
            for action in &changed {
                let data = encode(action)?;
                table.insert(action.id, data.as_slice())?;
            }
            changed.len()
        };
        write_txn.commit()?;
        Ok(changed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound Actions
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a received action. Returns `false` if its hash is already known.
    pub fn insert_inbound_action(&self, action: &InboundAction) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(INBOUND_ACTIONS_TABLE)?;
            let key = action.blob_hash.as_str();
            let known = table.get(key)?.is_some();
            if !known {
                let data = encode(action)?;
                table.insert(key, data.as_slice())?;
            }
            !known
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    pub fn load_inbound_action(&self, hash: &BlobHash) -> Result<Option<InboundAction>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(INBOUND_ACTIONS_TABLE)?;
        match table.get(hash.as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Unprocessed actions, oldest first.
    pub fn list_unprocessed_actions(&self) -> Result<Vec<InboundAction>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(INBOUND_ACTIONS_TABLE)?;

        let mut actions: Vec<InboundAction> = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let action: InboundAction = decode(value.value())?;
            if !action.processed {
                actions.push(action);
            }
        }
        actions.sort_by_key(|a| a.timestamp);
        Ok(actions)
    }

    /// Mark an inbound action processed. Returns `false` if it already was.
    pub fn mark_action_processed(&self, hash: &BlobHash) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(INBOUND_ACTIONS_TABLE)?;
            let action: Option<InboundAction> = match table.get(hash.as_str())? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            match action {
                Some(mut action) if !action.processed => {
                    action.processed = true;
                    let data = encode(&action)?;
                    table.insert(hash.as_str(), data.as_slice())?;
                    true
                }
                Some(_) => false,
                None => return Err(SyncError::NotFound(format!("action {}", hash))),
            }
        };
        write_txn.commit()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::test_support::temp_storage;
    use crate::types::{ActionKind, BlobHash, InboundAction, NodeId, OutboundAction};

    fn published(storage: &crate::storage::Storage, action: OutboundAction, at: u64) -> OutboundAction {
        let mut action = storage.queue_action(&action).unwrap();
        action.blob_hash = Some(BlobHash::of(format!("action-{}", action.id).as_bytes()));
        action.published_at = Some(at);
        storage.update_outbound_action(&action).unwrap();
        action
    }

    fn peer(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    #[test]
    fn test_update_key_supersedes_previous() {
        let (storage, _dir) = temp_storage();
        let first = storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::UpdateKey, "k1", Some(5)))
            .unwrap();
        storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::UpdateKey, "other", Some(6)))
            .unwrap();
        storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::UpdateKey, "k2", Some(5)))
            .unwrap();

        let live = storage.list_unpublished_actions().unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|a| a.id != first.id));
        assert!(live.iter().any(|a| a.data == "k2"));
    }

    #[test]
    fn test_delete_actions_accumulate() {
        let (storage, _dir) = temp_storage();
        storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::Delete, "h1", None))
            .unwrap();
        storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::Delete, "h2", None))
            .unwrap();
        assert_eq!(storage.list_unpublished_actions().unwrap().len(), 2);
    }

    #[test]
    fn test_published_actions_are_listed_for_manifest() {
        let (storage, _dir) = temp_storage();
        let mut action = storage
            .queue_action(&OutboundAction::new(peer(2), ActionKind::Delete, "h", None))
            .unwrap();
        assert!(storage.list_manifest_actions().unwrap().is_empty());

        action.blob_hash = Some(BlobHash::of(b"action"));
        storage.update_outbound_action(&action).unwrap();
        assert_eq!(storage.list_manifest_actions().unwrap().len(), 1);
        assert!(storage.list_unpublished_actions().unwrap().is_empty());
    }

    #[test]
    fn test_inbound_actions_processed_once() {
        let (storage, _dir) = temp_storage();
        let hash = BlobHash::of(b"inbound");
        let action = InboundAction {
            blob_hash: hash.clone(),
            sender: peer(3),
            kind: ActionKind::Introduce,
            data: String::new(),
            timestamp: 1,
            circle_id: None,
            processed: false,
        };
        assert!(storage.insert_inbound_action(&action).unwrap());
        assert!(!storage.insert_inbound_action(&action).unwrap());
        assert_eq!(storage.list_unprocessed_actions().unwrap().len(), 1);

        assert!(storage.mark_action_processed(&hash).unwrap());
        assert!(!storage.mark_action_processed(&hash).unwrap());
        assert!(storage.list_unprocessed_actions().unwrap().is_empty());
        assert!(storage.load_inbound_action(&hash).unwrap().unwrap().processed);
    }

    #[test]
    fn test_synced_actions_leave_the_manifest() {
        let (storage, _dir) = temp_storage();
        let old = published(&storage, OutboundAction::new(peer(1), ActionKind::Delete, "h1", Some(2)), 100);
        let recent = published(&storage, OutboundAction::new(peer(1), ActionKind::Delete, "h2", Some(2)), 500);

        assert_eq!(storage.mark_actions_synced(200).unwrap(), 1);
        let listed: Vec<u64> = storage.list_manifest_actions().unwrap().iter().map(|a| a.id).collect();
        assert_eq!(listed, vec![recent.id]);
        assert!(!listed.contains(&old.id));

        // Already synced rows are not counted twice
        assert_eq!(storage.mark_actions_synced(200).unwrap(), 0);
    }

    #[test]
    fn test_current_key_outlives_the_window() {
        let (storage, _dir) = temp_storage();
        published(&storage, OutboundAction::new(peer(1), ActionKind::UpdateKey, "k", Some(2)), 100);
        // Never published yet: no clock to expire on
        storage
            .queue_action(&OutboundAction::new(peer(1), ActionKind::Delete, "h", Some(2)))
            .unwrap();

        assert_eq!(storage.mark_actions_synced(u64::MAX).unwrap(), 0);
        assert_eq!(storage.list_manifest_actions().unwrap().len(), 1);
        assert_eq!(storage.list_unpublished_actions().unwrap().len(), 1);
    }

    #[test]
    fn test_retire_key_actions_for_one_recipient() {
        let (storage, _dir) = temp_storage();
        published(&storage, OutboundAction::new(peer(1), ActionKind::UpdateKey, "k1", Some(2)), 1);
        published(&storage, OutboundAction::new(peer(2), ActionKind::UpdateKey, "k2", Some(2)), 1);
        published(&storage, OutboundAction::new(peer(1), ActionKind::UpdateKey, "k3", Some(3)), 1);
        published(&storage, OutboundAction::new(peer(1), ActionKind::Delete, "h", Some(2)), 1);

        assert_eq!(storage.retire_key_actions(2, Some(&peer(1))).unwrap(), 1);
        let live: Vec<String> = storage
            .list_manifest_actions()
            .unwrap()
            .into_iter()
            .map(|a| a.data)
            .collect();
        assert_eq!(live.len(), 3);
        assert!(!live.contains(&"k1".to_string()));

        assert_eq!(storage.retire_key_actions(2, None).unwrap(), 1);
        assert_eq!(storage.list_manifest_actions().unwrap().len(), 2);
    }
}
