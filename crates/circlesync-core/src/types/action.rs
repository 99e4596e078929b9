//! Actions: directives addressed to a single peer

use serde::{Deserialize, Serialize};

use super::{BlobHash, CircleId, NodeId, Timestamp};

/// What an action asks the recipient to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// `data` is a wrapped circle key
    UpdateKey,
    /// `data` is the blob hash of a post the sender deleted
    Delete,
    /// Reserved; recipients log and ignore it
    Introduce,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::UpdateKey => "UpdateKey",
            ActionKind::Delete => "Delete",
            ActionKind::Introduce => "Introduce",
        };
        f.write_str(s)
    }
}

/// An action queued locally for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundAction {
    pub id: u64,
    pub recipient: NodeId,
    pub kind: ActionKind,
    pub data: String,
    pub timestamp: Timestamp,
    pub circle_id: Option<CircleId>,
    /// Set once the action blob is stored
    pub blob_hash: Option<BlobHash>,
    /// When the blob was stored and the action first listed
    pub published_at: Option<Timestamp>,
    /// Carried for the whole retention window; no longer listed
    pub synced: bool,
    /// Superseded or revoked actions are no longer listed in manifests
    pub retired: bool,
}

impl OutboundAction {
    pub fn new(
        recipient: NodeId,
        kind: ActionKind,
        data: impl Into<String>,
        circle_id: Option<CircleId>,
    ) -> Self {
        Self {
            id: 0,
            recipient,
            kind,
            data: data.into(),
            timestamp: super::now_millis(),
            circle_id,
            blob_hash: None,
            published_at: None,
            synced: false,
            retired: false,
        }
    }

    pub fn is_published(&self) -> bool {
        self.blob_hash.is_some()
    }

    /// Still listed in the manifests this node publishes.
    pub fn is_live(&self) -> bool {
        !self.retired && !self.synced
    }

    /// The newest key for a recipient stays listed for as long as it is
    /// current, so members that come back late still receive it.
    pub fn expires(&self) -> bool {
        self.kind != ActionKind::UpdateKey
    }
}

/// An action received from a peer, keyed by its blob hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAction {
    pub blob_hash: BlobHash,
    pub sender: NodeId,
    pub kind: ActionKind,
    pub data: String,
    pub timestamp: Timestamp,
    pub circle_id: Option<CircleId>,
    pub processed: bool,
}
