//! Identity storage
//!
//! - **Primary table**: `identities` keyed by row id
//! - **Owner index**: node id hex -> row id (one identity per owner)
//! - **Hash index**: identity blob hash -> row id, for idempotent downloads

use crate::error::SyncError;
use crate::types::{BlobHash, Identity, IdentityId, NodeId};
use redb::{ReadableTable, TableDefinition, WriteTransaction};

use super::{decode, encode, next_id, Storage};

pub(crate) const IDENTITIES_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("identities");

pub(crate) const IDENTITY_OWNER_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("identity_owner_index");

pub(crate) const IDENTITY_HASH_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("identity_hash_index");

fn write_identity(txn: &WriteTransaction, identity: &Identity) -> Result<(), SyncError> {
    let mut table = txn.open_table(IDENTITIES_TABLE)?;
    let mut owners = txn.open_table(IDENTITY_OWNER_INDEX)?;
    let mut hashes = txn.open_table(IDENTITY_HASH_INDEX)?;

    let data = encode(identity)?;
    table.insert(identity.id, data.as_slice())?;
    owners.insert(identity.owner_node_id.to_hex().as_str(), identity.id)?;
    if let Some(hash) = &identity.self_blob_hash {
        hashes.insert(hash.as_str(), identity.id)?;
    }
    Ok(())
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a new identity, assigning its id.
    ///
    /// Fails if the owner already has an identity.
    pub fn insert_identity(&self, identity: &Identity) -> Result<Identity, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let owners = write_txn.open_table(IDENTITY_OWNER_INDEX)?;
            if owners
                .get(identity.owner_node_id.to_hex().as_str())?
                .is_some()
            {
                return Err(SyncError::InvalidOperation(format!(
                    "identity for {} already exists",
                    identity.owner_node_id.short()
                )));
            }
            drop(owners);

            let mut stored = identity.clone();
            stored.id = next_id(&write_txn, "identities")?;
            write_identity(&write_txn, &stored)?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// Overwrite an existing identity row.
    pub fn update_identity(&self, identity: &Identity) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let table = write_txn.open_table(IDENTITIES_TABLE)?;
            if table.get(identity.id)?.is_none() {
                return Err(SyncError::NotFound(format!("identity {}", identity.id)));
            }
            drop(table);
            write_identity(&write_txn, identity)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Find the identity for `owner`, inserting a placeholder if none exists.
    pub fn ensure_identity(&self, owner: &NodeId) -> Result<Identity, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let identity = {
            let owners = write_txn.open_table(IDENTITY_OWNER_INDEX)?;
            let existing = owners.get(owner.to_hex().as_str())?.map(|v| v.value());
            drop(owners);

            match existing {
                Some(id) => {
                    let table = write_txn.open_table(IDENTITIES_TABLE)?;
                    let row = table
                        .get(id)?
                        .ok_or_else(|| SyncError::Storage(format!("dangling identity {}", id)))?;
                    decode::<Identity>(row.value())?
                }
                None => {
                    let mut placeholder = Identity::placeholder(*owner);
                    placeholder.id = next_id(&write_txn, "identities")?;
                    write_identity(&write_txn, &placeholder)?;
                    placeholder
                }
            }
        };
        write_txn.commit()?;
        Ok(identity)
    }

    pub fn load_identity(&self, id: IdentityId) -> Result<Option<Identity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITIES_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn find_identity_by_owner(&self, owner: &NodeId) -> Result<Option<Identity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let owners = read_txn.open_table(IDENTITY_OWNER_INDEX)?;
        let Some(id) = owners.get(owner.to_hex().as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(IDENTITIES_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Look up an identity by a blob hash it was ever published or received under.
    pub fn find_identity_by_hash(&self, hash: &BlobHash) -> Result<Option<Identity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let hashes = read_txn.open_table(IDENTITY_HASH_INDEX)?;
        let Some(id) = hashes.get(hash.as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(IDENTITIES_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITIES_TABLE)?;

        let mut identities = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            identities.push(decode(value.value())?);
        }
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::test_support::temp_storage;
    use crate::types::{BlobHash, Identity, NodeId};

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    #[test]
    fn test_insert_and_find() {
        let (storage, _dir) = temp_storage();
        let alice = storage.insert_identity(&Identity::new(node(1), "Alice")).unwrap();
        assert_eq!(alice.id, 1);

        let found = storage.find_identity_by_owner(&node(1)).unwrap().unwrap();
        assert_eq!(found, alice);
        assert!(storage.find_identity_by_owner(&node(2)).unwrap().is_none());
    }

    #[test]
    fn test_one_identity_per_owner() {
        let (storage, _dir) = temp_storage();
        storage.insert_identity(&Identity::new(node(1), "Alice")).unwrap();
        assert!(storage.insert_identity(&Identity::new(node(1), "Again")).is_err());
    }

    #[test]
    fn test_hash_index_follows_updates() {
        let (storage, _dir) = temp_storage();
        let mut alice = storage.insert_identity(&Identity::new(node(1), "Alice")).unwrap();
        let hash = BlobHash::of(b"identity-v1");
        alice.self_blob_hash = Some(hash.clone());
        storage.update_identity(&alice).unwrap();

        let by_hash = storage.find_identity_by_hash(&hash).unwrap().unwrap();
        assert_eq!(by_hash.id, alice.id);
    }

    #[test]
    fn test_ensure_identity_creates_placeholder_once() {
        let (storage, _dir) = temp_storage();
        let first = storage.ensure_identity(&node(5)).unwrap();
        assert!(first.is_placeholder());

        let second = storage.ensure_identity(&node(5)).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_identities().unwrap().len(), 1);
    }
}
