//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Identities, circles and circle membership
//! - Posts and reactions (local and downloaded)
//! - Key records (sealed at rest by the key ring)
//! - Peer topics, the per-peer version gate
//! - Outbound and inbound actions
//! - Local publish state and the node secret
//!
//! Rows are postcard-encoded. Every multi-row change runs in one write
//! transaction, so readers never observe a half-applied update.

use crate::error::SyncError;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

mod actions;
mod circles;
mod identities;
mod keys;
mod peers;
mod posts;
mod reactions;
mod state;

use actions::{INBOUND_ACTIONS_TABLE, OUTBOUND_ACTIONS_TABLE};
use circles::{CIRCLES_TABLE, CIRCLE_MEMBERS_TABLE};
use identities::{IDENTITIES_TABLE, IDENTITY_HASH_INDEX, IDENTITY_OWNER_INDEX};
use keys::{KEYS_TABLE, KEY_SUBJECT_INDEX};
use peers::PEER_TOPICS_TABLE;
use posts::{POSTS_TABLE, POST_HASH_INDEX};
use reactions::{REACTIONS_TABLE, REACTION_KEY_INDEX, SEEN_REACTION_BLOBS};
use state::{NODE_SECRET_TABLE, SYNC_STATE_TABLE};

pub use keys::{KeyRecord, KeyType};

/// Monotonic id counters, one per row kind (key: counter name)
const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and every table if missing.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COUNTERS_TABLE)?;
            let _ = write_txn.open_table(IDENTITIES_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_OWNER_INDEX)?;
            let _ = write_txn.open_table(IDENTITY_HASH_INDEX)?;
            let _ = write_txn.open_table(CIRCLES_TABLE)?;
            let _ = write_txn.open_table(CIRCLE_MEMBERS_TABLE)?;
            let _ = write_txn.open_table(POSTS_TABLE)?;
            let _ = write_txn.open_table(POST_HASH_INDEX)?;
            let _ = write_txn.open_table(REACTIONS_TABLE)?;
            let _ = write_txn.open_table(REACTION_KEY_INDEX)?;
            let _ = write_txn.open_table(SEEN_REACTION_BLOBS)?;
            let _ = write_txn.open_table(KEYS_TABLE)?;
            let _ = write_txn.open_multimap_table(KEY_SUBJECT_INDEX)?;
            let _ = write_txn.open_table(PEER_TOPICS_TABLE)?;
            let _ = write_txn.open_table(OUTBOUND_ACTIONS_TABLE)?;
            let _ = write_txn.open_table(INBOUND_ACTIONS_TABLE)?;
            let _ = write_txn.open_table(SYNC_STATE_TABLE)?;
            let _ = write_txn.open_table(NODE_SECRET_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a reference to the shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Row helpers
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    postcard::to_allocvec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Allocate the next id for `counter` inside an open write transaction.
///
/// Ids start at 1 and never repeat, so "highest id" means "newest row".
pub(crate) fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64, SyncError> {
    let mut table = txn.open_table(COUNTERS_TABLE)?;
    let next = table.get(counter)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(counter, next)?;
    Ok(next)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use tempfile::TempDir;

    /// Fresh storage in a temp dir; keep the dir alive for the test's duration.
    pub fn temp_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        (storage, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_storage;
    use super::*;

    #[test]
    fn test_storage_creation() {
        let (_storage, dir) = temp_storage();
        assert!(dir.path().join("test.redb").exists());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (storage, _dir) = temp_storage();
        let db = storage.db_handle();
        let db = db.read();

        let txn = db.begin_write().unwrap();
        let a = next_id(&txn, "things").unwrap();
        let b = next_id(&txn, "things").unwrap();
        let other = next_id(&txn, "others").unwrap();
        txn.commit().unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(other, 1);
    }

    #[test]
    fn test_storage_reopen_preserves_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reopen.redb");
        {
            let storage = Storage::new(&path).unwrap();
            let db = storage.db_handle();
            let db = db.read();
            let txn = db.begin_write().unwrap();
            next_id(&txn, "things").unwrap();
            txn.commit().unwrap();
        }

        let storage = Storage::new(&path).unwrap();
        let db = storage.db_handle();
        let db = db.read();
        let txn = db.begin_write().unwrap();
        assert_eq!(next_id(&txn, "things").unwrap(), 2);
        txn.commit().unwrap();
    }
}
