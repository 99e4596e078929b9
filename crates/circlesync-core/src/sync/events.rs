//! Sync events for observers
//!
//! The engine publishes [`SyncEvent`]s on a tokio broadcast channel. Slow
//! subscribers lag and lose old events; sync itself never blocks on them.

use std::fmt;

use tokio::sync::broadcast;

use crate::types::{BlobHash, CircleId, NodeId};

/// Why an announcement was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Version at or below the last applied one
    Stale,
    /// No subscription row for the publisher
    UnknownPeer,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Stale => write!(f, "stale"),
            IgnoreReason::UnknownPeer => write!(f, "unknown peer"),
        }
    }
}

/// Events emitted during synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// This node signed and stored a new manifest
    AnnouncementPublished { version: u64, manifest_hash: BlobHash },
    AnnouncementIgnored {
        peer: NodeId,
        version: u64,
        reason: IgnoreReason,
    },
    /// A peer's manifest was fully applied and the version advanced
    ManifestApplied {
        peer: NodeId,
        version: u64,
        posts_added: usize,
        reactions_applied: usize,
        actions_processed: usize,
    },
    /// A pass stopped early; the version did not advance
    ManifestFailed {
        peer: NodeId,
        version: u64,
        error: String,
    },
    /// Listening on a peer's topic
    PeerSubscribed { peer: NodeId },
    /// A neighbor joined one of our topics
    PeerJoined { peer: NodeId },
    PeerLeft { peer: NodeId },
    /// A circle key from a peer was stored
    KeyReceived {
        peer: NodeId,
        circle: Option<CircleId>,
    },
}

/// Sender half plus capacity, shared by every component.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit without caring whether anyone listens.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(SyncEvent::PeerJoined {
            peer: NodeId::from_bytes([1u8; 32]),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let peer = NodeId::from_bytes([1u8; 32]);
        bus.emit(SyncEvent::PeerSubscribed { peer });
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::PeerSubscribed { peer });
    }

    #[test]
    fn test_ignore_reason_display() {
        assert_eq!(IgnoreReason::Stale.to_string(), "stale");
    }
}
