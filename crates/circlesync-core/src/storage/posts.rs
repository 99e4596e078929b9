//! Post storage with a blob-hash index for idempotent ingestion

use crate::error::SyncError;
use crate::types::{BlobHash, CircleId, IdentityId, Post, PostId, Timestamp};
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, next_id, Storage};

pub(crate) const POSTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("posts");

/// Blob hash -> post id
pub(crate) const POST_HASH_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("post_hash_index");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Post Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a post and assign its id.
    ///
    /// If the post carries a blob hash that is already indexed, the existing
    /// row is returned unchanged.
    pub fn insert_post(&self, post: &Post) -> Result<Post, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            if let Some(hash) = &post.blob_hash {
                let index = write_txn.open_table(POST_HASH_INDEX)?;
                let existing = index.get(hash.as_str())?.map(|v| v.value());
                drop(index);
                if let Some(id) = existing {
                    let table = write_txn.open_table(POSTS_TABLE)?;
                    if let Some(row) = table.get(id)? {
                        return decode(row.value());
                    };
                }
            }

            let mut stored = post.clone();
            stored.id = next_id(&write_txn, "posts")?;
            let mut table = write_txn.open_table(POSTS_TABLE)?;
            let mut index = write_txn.open_table(POST_HASH_INDEX)?;
            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            if let Some(hash) = &stored.blob_hash {
                index.insert(hash.as_str(), stored.id)?;
            }
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// Overwrite a post row, moving its hash index entry if the hash changed.
    pub fn update_post(&self, post: &Post) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(POSTS_TABLE)?;
            let mut index = write_txn.open_table(POST_HASH_INDEX)?;

            let previous: Post = match table.get(post.id)? {
                Some(v) => decode(v.value())?,
                None => return Err(SyncError::NotFound(format!("post {}", post.id))),
            };
            if let Some(old) = &previous.blob_hash {
                if post.blob_hash.as_ref() != Some(old) {
                    index.remove(old.as_str())?;
                }
            }

            let data = encode(post)?;
            table.insert(post.id, data.as_slice())?;
            if let Some(hash) = &post.blob_hash {
                index.insert(hash.as_str(), post.id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_post(&self, id: PostId) -> Result<Option<Post>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(POSTS_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn find_post_by_hash(&self, hash: &BlobHash) -> Result<Option<Post>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(POST_HASH_INDEX)?;
        let Some(id) = index.get(hash.as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(POSTS_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_posts(&self) -> Result<Vec<Post>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(POSTS_TABLE)?;

        let mut posts = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            posts.push(decode(value.value())?);
        }
        Ok(posts)
    }

    pub fn list_posts_by_author(&self, author: IdentityId) -> Result<Vec<Post>, SyncError> {
        Ok(self
            .list_posts()?
            .into_iter()
            .filter(|p| p.author_identity_id == author)
            .collect())
    }

    /// Posts by `author` published into `circle` (circle id in the author's space).
    pub fn list_posts_in_circle(
        &self,
        author: IdentityId,
        circle: CircleId,
    ) -> Result<Vec<Post>, SyncError> {
        Ok(self
            .list_posts_by_author(author)?
            .into_iter()
            .filter(|p| p.circle_id == Some(circle))
            .collect())
    }

    pub fn list_posts_since(&self, since: Timestamp) -> Result<Vec<Post>, SyncError> {
        Ok(self
            .list_posts()?
            .into_iter()
            .filter(|p| p.timestamp >= since)
            .collect())
    }

    /// Delete a post row and its hash index entry. Returns the removed row.
    pub fn delete_post(&self, id: PostId) -> Result<Option<Post>, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(POSTS_TABLE)?;
            let mut index = write_txn.open_table(POST_HASH_INDEX)?;
            let removed: Option<Post> = match table.remove(id)? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };
            if let Some(hash) = removed.as_ref().and_then(|p| p.blob_hash.as_ref()) {
                index.remove(hash.as_str())?;
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}
