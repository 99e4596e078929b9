//! Circle and membership storage

use crate::error::SyncError;
use crate::types::{Circle, CircleId, IdentityId};
use redb::{ReadableTable, TableDefinition};

use super::{decode, encode, next_id, Storage};

pub(crate) const CIRCLES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("circles");

/// Membership join table (key: (circle id, identity id))
pub(crate) const CIRCLE_MEMBERS_TABLE: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("circle_members");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Circle Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn insert_circle(&self, circle: &Circle) -> Result<Circle, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut stored = circle.clone();
            stored.id = next_id(&write_txn, "circles")?;
            let mut table = write_txn.open_table(CIRCLES_TABLE)?;
            let data = encode(&stored)?;
            table.insert(stored.id, data.as_slice())?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    pub fn update_circle(&self, circle: &Circle) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CIRCLES_TABLE)?;
            if table.get(circle.id)?.is_none() {
                return Err(SyncError::NotFound(format!("circle {}", circle.id)));
            }
            let data = encode(circle)?;
            table.insert(circle.id, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_circle(&self, id: CircleId) -> Result<Option<Circle>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CIRCLES_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_circles(&self) -> Result<Vec<Circle>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CIRCLES_TABLE)?;

        let mut circles = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            circles.push(decode(value.value())?);
        }
        Ok(circles)
    }

    /// The default circle, if onboarding has created it.
    pub fn everyone_circle(&self) -> Result<Option<Circle>, SyncError> {
        Ok(self.list_circles()?.into_iter().find(|c| c.is_everyone))
    }

    /// Delete a circle and its memberships. The everyone circle cannot be deleted.
    pub fn delete_circle(&self, id: CircleId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CIRCLES_TABLE)?;
            let circle: Circle = match table.get(id)? {
                Some(v) => decode(v.value())?,
                None => return Err(SyncError::NotFound(format!("circle {}", id))),
            };
            if circle.is_everyone {
                return Err(SyncError::InvalidOperation(
                    "the everyone circle cannot be deleted".to_string(),
                ));
            }
            table.remove(id)?;

            let mut members = write_txn.open_table(CIRCLE_MEMBERS_TABLE)?;
            let keys: Vec<(u64, u64)> = members
                .range((id, 0)..=(id, u64::MAX))?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                members.remove(key)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Clear the stored manifest hash so the next publish rebuilds it.
    pub fn invalidate_circle_manifest(&self, id: CircleId) -> Result<(), SyncError> {
        if let Some(mut circle) = self.load_circle(id)? {
            if circle.manifest_blob_hash.take().is_some() {
                self.update_circle(&circle)?;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Membership
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a member. Returns `false` if already a member.
    pub fn add_circle_member(
        &self,
        circle: CircleId,
        identity: IdentityId,
    ) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let added = {
            let mut members = write_txn.open_table(CIRCLE_MEMBERS_TABLE)?;
            let added = members.insert((circle, identity), ())?.is_none();
            added
        };
        write_txn.commit()?;
        Ok(added)
    }

    /// Remove a member. Returns `false` if it was not a member.
    pub fn remove_circle_member(
        &self,
        circle: CircleId,
        identity: IdentityId,
    ) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut members = write_txn.open_table(CIRCLE_MEMBERS_TABLE)?;
            let removed = members.remove((circle, identity))?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_circle_members(&self, circle: CircleId) -> Result<Vec<IdentityId>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let members = read_txn.open_table(CIRCLE_MEMBERS_TABLE)?;

        let mut ids = Vec::new();
        for entry in members.range((circle, 0)..=(circle, u64::MAX))? {
            let (key, _) = entry?;
            ids.push(key.value().1);
        }
        Ok(ids)
    }

    pub fn is_circle_member(&self, circle: CircleId, identity: IdentityId) -> Result<bool, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let members = read_txn.open_table(CIRCLE_MEMBERS_TABLE)?;
        let member = members.get((circle, identity))?.is_some();
        Ok(member)
    }
}
