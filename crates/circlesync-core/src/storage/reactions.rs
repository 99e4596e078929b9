//! Reaction storage
//!
//! Reactions are unique per `(post hash, author, emoji)`. Downloaded reaction
//! blobs are remembered by hash so a tombstone or insert is applied once.

use crate::error::SyncError;
use crate::types::{BlobHash, NodeId, Reaction};
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, next_id, Storage};

pub(crate) const REACTIONS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("reactions");

/// Natural key -> reaction id
pub(crate) const REACTION_KEY_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("reaction_key_index");

/// Reaction blob hashes already ingested
pub(crate) const SEEN_REACTION_BLOBS: TableDefinition<&str, ()> =
    TableDefinition::new("seen_reaction_blobs");

fn natural_key(post_hash: &BlobHash, author: &NodeId, emoji: &str) -> String {
    format!("{}|{}|{}", post_hash, author, emoji)
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Reaction Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace the reaction for its natural key.
    pub fn upsert_reaction(&self, reaction: &Reaction) -> Result<Reaction, SyncError> {
        let key = natural_key(&reaction.post_hash, &reaction.author_node_id, &reaction.emoji);
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let index = write_txn.open_table(REACTION_KEY_INDEX)?;
            let existing = index.get(key.as_str())?.map(|v| v.value());
            drop(index);

            let mut stored = reaction.clone();
            stored.id = match existing {
                Some(id) => id,
                None => next_id(&write_txn, "reactions")?,
            };

            let mut table = write_txn.open_table(REACTIONS_TABLE)?;
            let mut index = write_txn.open_table(REACTION_KEY_INDEX)?;
            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            index.insert(key.as_str(), stored.id)?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn update_reaction(&self, reaction: &Reaction) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(REACTIONS_TABLE)?;
            if table.get(reaction.id)?.is_none() {
                return Err(SyncError::NotFound(format!("reaction {}", reaction.id)));
            }
            let data = encode(reaction)?;
            table.insert(reaction.id, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn find_reaction(
        &self,
        post_hash: &BlobHash,
        author: &NodeId,
        emoji: &str,
    ) -> Result<Option<Reaction>, SyncError> {
        let key = natural_key(post_hash, author, emoji);
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(REACTION_KEY_INDEX)?;
        let Some(id) = index.get(key.as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(REACTIONS_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Delete by natural key. Returns `true` if a row was removed.
    pub fn delete_reaction(
        &self,
        post_hash: &BlobHash,
        author: &NodeId,
        emoji: &str,
    ) -> Result<bool, SyncError> {
        let key = natural_key(post_hash, author, emoji);
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut index = write_txn.open_table(REACTION_KEY_INDEX)?;
            let id = index.remove(key.as_str())?.map(|v| v.value());
            match id {
                Some(id) => {
                    let mut table = write_txn.open_table(REACTIONS_TABLE)?;
                    table.remove(id)?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// All reaction rows, including local tombstones.
    pub fn list_reactions(&self) -> Result<Vec<Reaction>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(REACTIONS_TABLE)?;

        let mut reactions = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            reactions.push(decode(value.value())?);
        }
        Ok(reactions)
    }

    /// Visible reactions on a post.
    pub fn list_reactions_for_post(&self, post_hash: &BlobHash) -> Result<Vec<Reaction>, SyncError> {
        Ok(self
            .list_reactions()?
            .into_iter()
            .filter(|r| &r.post_hash == post_hash && !r.removed)
            .collect())
    }

    /// Reactions (and tombstones) authored by `author`.
    pub fn list_reactions_by_author(&self, author: &NodeId) -> Result<Vec<Reaction>, SyncError> {
        Ok(self
            .list_reactions()?
            .into_iter()
            .filter(|r| &r.author_node_id == author)
            .collect())
    }

    /// Record an ingested reaction blob. Returns `false` if it was already seen.
    pub fn mark_reaction_blob_seen(&self, hash: &BlobHash) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let fresh = {
            let mut seen = write_txn.open_table(SEEN_REACTION_BLOBS)?;
            let fresh = seen.insert(hash.as_str(), ())?.is_none();
            fresh
        };
        write_txn.commit()?;
        Ok(fresh)
    }

    pub fn is_reaction_blob_seen(&self, hash: &BlobHash) -> Result<bool, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let seen = read_txn.open_table(SEEN_REACTION_BLOBS)?;
        let seen_before = seen.get(hash.as_str())?.is_some();
        Ok(seen_before)
    }
}
