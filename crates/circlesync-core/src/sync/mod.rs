//! Manifest-based synchronization
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SubscriptionManager                                            │
//! │  ├── own topic: re-broadcast announcement on NeighborUp         │
//! │  └── one listener task per peer topic                           │
//! │            │ Announcement                                       │
//! │            ▼                                                    │
//! │  ManifestProtocol                                               │
//! │  ├── version gate + signature check                             │
//! │  ├── identity -> actions -> circle manifests                    │
//! │  └── advance PeerTopic only after a complete pass               │
//! │            │                                                    │
//! │            ▼                                                    │
//! │  Downloader (fetch, decrypt, ingest)   Publisher (encrypt, put) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component shares one [`SyncContext`].

pub mod downloader;
pub mod events;
pub mod gossip;
pub mod manifest;
pub mod memory;
pub mod publisher;
pub mod topics;

use std::sync::Arc;

use bytes::Bytes;

use crate::blobs::{fetch_required, BlobStore};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::keys::KeyRing;
use crate::storage::Storage;
use crate::types::{BlobHash, Identity, NodeId};

pub use downloader::{ActionReport, CircleReport, Downloader};
pub use events::{EventBus, IgnoreReason, SyncEvent};
pub use gossip::{GossipTransport, IrohGossip, TopicBroadcaster, TopicEvent, TopicSubscription};
pub use manifest::{ManifestProtocol, ManifestReport, PassStage, ProcessingOutcome, PASS_ORDER};
pub use memory::{MemoryGossip, MemoryGossipHub};
pub use publisher::{PublishReport, Publisher};
pub use topics::SubscriptionManager;

/// State shared by the publisher, downloader and protocol.
#[derive(Clone)]
pub struct SyncContext {
    pub storage: Storage,
    pub blobs: Arc<dyn BlobStore>,
    pub keys: KeyRing,
    pub keypair: Arc<NodeKeypair>,
    pub config: Arc<SyncConfig>,
    pub events: EventBus,
}

impl SyncContext {
    pub fn new(
        storage: Storage,
        blobs: Arc<dyn BlobStore>,
        keypair: Arc<NodeKeypair>,
        config: Arc<SyncConfig>,
    ) -> Self {
        let keys = KeyRing::new(storage.clone(), &keypair);
        let events = EventBus::new(config.event_channel_capacity);
        Self {
            storage,
            blobs,
            keys,
            keypair,
            config,
            events,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    /// This node's identity row. `NotFound` before onboarding.
    pub fn local_identity(&self) -> SyncResult<Identity> {
        self.storage
            .find_identity_by_owner(&self.node_id())?
            .ok_or_else(|| SyncError::NotFound("local identity; onboard first".to_string()))
    }

    /// Fetch a blob from `peer`, bounded by the configured timeout.
    pub async fn fetch(&self, hash: &BlobHash, peer: &NodeId) -> SyncResult<Bytes> {
        let timeout = self.config.fetch_timeout();
        match tokio::time::timeout(timeout, fetch_required(self.blobs.as_ref(), hash, peer)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::TransportFailure(format!(
                "timed out after {:?} fetching {} from {}",
                timeout,
                hash,
                peer.short()
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::storage::test_support::temp_storage;

    /// Context over a temp database and a standalone memory blob store.
    pub fn temp_context() -> (SyncContext, MemoryBlobStore, tempfile::TempDir) {
        let (storage, dir) = temp_storage();
        let blobs = MemoryBlobStore::new();
        let ctx = SyncContext::new(
            storage,
            Arc::new(blobs.clone()),
            Arc::new(NodeKeypair::generate()),
            Arc::new(SyncConfig::with_data_dir(dir.path())),
        );
        (ctx, blobs, dir)
    }

    /// Local identity plus a keyed "everyone" circle.
    pub fn onboard(ctx: &SyncContext) {
        use crate::types::Circle;
        let me = ctx
            .storage
            .insert_identity(&Identity::new(ctx.node_id(), "me"))
            .unwrap();
        let circle = ctx.storage.insert_circle(&Circle::everyone(me.id)).unwrap();
        ctx.keys.generate_circle_key(circle.id).unwrap();
    }
}
