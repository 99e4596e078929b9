//! Key record storage
//!
//! Key records are addressed by a subject string (`"<peer hex>"`,
//! `"circle:<id>"` or `"<peer hex>:circle:<id>"`). Material is stored sealed;
//! the key ring owns sealing and unsealing.

use crate::error::SyncError;
use crate::types::Timestamp;
use redb::{MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{decode, encode, next_id, Storage};

pub(crate) const KEYS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("keys");

/// Subject -> key ids
pub(crate) const KEY_SUBJECT_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("key_subject_index");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Secret,
    Public,
}

/// A stored key. `id` is store-assigned and increases with insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: u64,
    pub subject: String,
    pub alias: String,
    pub algorithm: String,
    pub key_type: KeyType,
    /// Sealed key material
    pub material: Option<Vec<u8>>,
    pub created_at: Timestamp,
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Key Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a key record without touching existing keys for the subject.
    pub fn insert_key(&self, record: &KeyRecord) -> Result<KeyRecord, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut stored = record.clone();
            stored.id = next_id(&write_txn, "keys")?;
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let mut index = write_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;
            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            index.insert(stored.subject.as_str(), stored.id)?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// Delete every Secret key of the record's subject and insert the record,
    /// in one write transaction.
    pub fn replace_secret_keys(&self, record: &KeyRecord) -> Result<KeyRecord, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let mut index = write_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;

            let mut ids = Vec::new();
            for entry in index.get(record.subject.as_str())? {
                ids.push(entry?.value());
            }

            for id in ids {
                let existing: Option<KeyRecord> = match table.get(id)? {
                    Some(v) => Some(decode(v.value())?),
                    None => None,
                };
                if let Some(existing) = existing {
                    if existing.key_type == KeyType::Secret {
                        table.remove(id)?;
                        index.remove(record.subject.as_str(), id)?;
                    }
                }
            }
            drop(table);
            drop(index);

            let mut stored = record.clone();
            stored.id = next_id(&write_txn, "keys")?;
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let mut index = write_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;
            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            index.insert(stored.subject.as_str(), stored.id)?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// All keys of a subject, newest (highest id) first.
    pub fn list_keys(&self, subject: &str) -> Result<Vec<KeyRecord>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;
        let index = read_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;

        let mut keys: Vec<KeyRecord> = Vec::new();
        for entry in index.get(subject)? {
            let id = entry?.value();
            if let Some(v) = table.get(id)? {
                keys.push(decode(v.value())?);
            }
        }
        keys.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(keys)
    }

    /// Delete every key of a subject. Returns the number removed.
    pub fn delete_keys(&self, subject: &str) -> Result<usize, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let mut index = write_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;
            let mut count = 0;
            for entry in index.remove_all(subject)? {
                table.remove(entry?.value())?;
                count += 1;
            }
            count
        };
        write_txn.commit()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_storage;

    fn record(subject: &str, key_type: KeyType, byte: u8) -> KeyRecord {
        KeyRecord {
            id: 0,
            subject: subject.to_string(),
            alias: format!("{}-{}", subject, byte),
            algorithm: "test".to_string(),
            key_type,
            material: Some(vec![byte; 4]),
            created_at: 0,
        }
    }

    #[test]
    fn test_list_newest_first() {
        let (storage, _dir) = temp_storage();
        storage.insert_key(&record("peer", KeyType::Secret, 1)).unwrap();
        storage.insert_key(&record("peer", KeyType::Secret, 2)).unwrap();
        storage.insert_key(&record("other", KeyType::Secret, 3)).unwrap();

        let keys = storage.list_keys("peer").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].material, Some(vec![2; 4]));
        assert!(keys[0].id > keys[1].id);
    }

    #[test]
    fn test_replace_secret_keys_keeps_public_keys() {
        let (storage, _dir) = temp_storage();
        storage.insert_key(&record("peer", KeyType::Public, 9)).unwrap();
        storage.insert_key(&record("peer", KeyType::Secret, 1)).unwrap();
        storage.insert_key(&record("peer", KeyType::Secret, 2)).unwrap();

        storage.replace_secret_keys(&record("peer", KeyType::Secret, 3)).unwrap();

        let keys = storage.list_keys("peer").unwrap();
        let secrets: Vec<_> = keys.iter().filter(|k| k.key_type == KeyType::Secret).collect();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].material, Some(vec![3; 4]));
        assert!(keys.iter().any(|k| k.key_type == KeyType::Public));
    }

    #[test]
    fn test_delete_keys() {
        let (storage, _dir) = temp_storage();
        storage.insert_key(&record("circle:1", KeyType::Secret, 1)).unwrap();
        storage.insert_key(&record("circle:1", KeyType::Secret, 2)).unwrap();
        assert_eq!(storage.delete_keys("circle:1").unwrap(), 2);
        assert!(storage.list_keys("circle:1").unwrap().is_empty());
    }
}
