//! Local node state: publish counter and node secret

use crate::error::SyncError;
use crate::types::LocalSyncState;
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, Storage};

pub(crate) const SYNC_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("sync_state");

pub(crate) const NODE_SECRET_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("node_secret");

const LOCAL_STATE_KEY: &str = "local";
const NODE_SEED_KEY: &str = "ed25519_seed";

impl Storage {
    /// The persisted publish state, or the default for a fresh node.
    pub fn load_sync_state(&self) -> Result<LocalSyncState, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SYNC_STATE_TABLE)?;
        match table.get(LOCAL_STATE_KEY)? {
            Some(v) => decode(v.value()),
            None => Ok(LocalSyncState::default()),
        }
    }

    /// Persist the publish state. The version may never decrease.
    pub fn save_sync_state(&self, state: &LocalSyncState) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_STATE_TABLE)?;
            let current: Option<LocalSyncState> = match table.get(LOCAL_STATE_KEY)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            if let Some(current) = current {
                if state.version < current.version {
                    return Err(SyncError::InvalidOperation(format!(
                        "publish version cannot go from {} to {}",
                        current.version, state.version
                    )));
                }
            }
            let data = encode(state)?;
            table.insert(LOCAL_STATE_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// The node's Ed25519 seed, if one was stored.
    pub fn load_node_seed(&self) -> Result<Option<[u8; 32]>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NODE_SECRET_TABLE)?;
        match table.get(NODE_SEED_KEY)? {
            Some(v) => {
                let seed: [u8; 32] = v
                    .value()
                    .try_into()
                    .map_err(|_| SyncError::Storage("node seed must be 32 bytes".to_string()))?;
                Ok(Some(seed))
            }
            None => Ok(None),
        }
    }

    pub fn save_node_seed(&self, seed: &[u8; 32]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODE_SECRET_TABLE)?;
            table.insert(NODE_SEED_KEY, seed.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::test_support::temp_storage;
    use crate::types::{BlobHash, LocalSyncState};

    #[test]
    fn test_default_state() {
        let (storage, _dir) = temp_storage();
        assert_eq!(storage.load_sync_state().unwrap(), LocalSyncState::default());
    }

    #[test]
    fn test_state_version_is_monotonic() {
        let (storage, _dir) = temp_storage();
        let state = LocalSyncState {
            version: 4,
            last_manifest_hash: Some(BlobHash::of(b"m4")),
            ..Default::default()
        };
        storage.save_sync_state(&state).unwrap();
        assert_eq!(storage.load_sync_state().unwrap().version, 4);

        let older = LocalSyncState {
            version: 3,
            ..Default::default()
        };
        assert!(storage.save_sync_state(&older).is_err());
        assert_eq!(storage.load_sync_state().unwrap().version, 4);
    }

    #[test]
    fn test_node_seed_roundtrip() {
        let (storage, _dir) = temp_storage();
        assert!(storage.load_node_seed().unwrap().is_none());
        storage.save_node_seed(&[7u8; 32]).unwrap();
        assert_eq!(storage.load_node_seed().unwrap(), Some([7u8; 32]));
    }
}
