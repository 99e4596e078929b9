//! Topic subscription manager
//!
//! Keeps one subscription on this node's own topic, where announcements
//! are broadcast, and one per known peer, where that peer's announcements
//! arrive. Each subscription is drained by its own listener task; all tasks
//! share a parent [`CancellationToken`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::SyncEvent;
use super::gossip::{GossipTransport, TopicBroadcaster, TopicEvent, TopicSubscription};
use super::manifest::{ManifestProtocol, ProcessingOutcome};
use super::SyncContext;
use crate::error::SyncResult;
use crate::types::{NodeId, TopicKey};
use crate::wire::{from_json, to_json, Announcement, UserManifest};

struct PeerListener {
    topic: TopicKey,
    cancel: CancellationToken,
}

pub struct SubscriptionManager {
    ctx: SyncContext,
    protocol: Arc<ManifestProtocol>,
    transport: Arc<dyn GossipTransport>,
    own_sender: RwLock<Option<Arc<dyn TopicBroadcaster>>>,
    peers: Mutex<HashMap<NodeId, PeerListener>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        ctx: SyncContext,
        protocol: Arc<ManifestProtocol>,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        Self {
            ctx,
            protocol,
            transport,
            own_sender: RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn own_topic(&self) -> TopicKey {
        TopicKey::for_node(&self.ctx.node_id())
    }

    pub fn is_started(&self) -> bool {
        self.own_sender.read().is_some()
    }

    /// Peers we currently listen to.
    pub fn subscribed_peers(&self) -> Vec<NodeId> {
        self.peers.lock().keys().copied().collect()
    }

    fn own_sender(&self) -> Option<Arc<dyn TopicBroadcaster>> {
        self.own_sender.read().clone()
    }

    /// Keep `handle` for shutdown, dropping listeners that already ended.
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Join our own topic and every known peer's topic, then re-broadcast
    /// the last announcement.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        if self.is_started() {
            return Ok(());
        }

        let peers = self.ctx.storage.list_peer_topics()?;
        for topic in &peers {
            if let Err(e) = self.transport.add_peer_hint(topic) {
                warn!(peer = %topic.peer_node_id.short(), error = %e, "Ignoring peer address hint");
            }
        }
        let bootstrap = peers.iter().map(|t| t.peer_node_id).collect();

        let own_topic = self.own_topic();
        let subscription = self.transport.subscribe(own_topic, bootstrap).await?;
        *self.own_sender.write() = Some(subscription.sender.clone());
        info!(topic = %own_topic.to_hex(), "Listening on own topic");

        let this = self.clone();
        let cancel = self.cancel.child_token();
        self.track(tokio::spawn(this.own_topic_loop(subscription, cancel)));

        for topic in peers {
            if let Err(e) = self
                .subscribe_to_new_peer(topic.peer_node_id, topic.topic_key)
                .await
            {
                warn!(peer = %topic.peer_node_id.short(), error = %e, "Failed to subscribe to peer topic");
            }
        }

        self.broadcast_current().await?;
        Ok(())
    }

    /// Listen on `peer`'s topic. Returns `false` when already subscribed.
    pub async fn subscribe_to_new_peer(
        self: &Arc<Self>,
        peer: NodeId,
        topic: TopicKey,
    ) -> SyncResult<bool> {
        if self.peers.lock().contains_key(&peer) {
            return Ok(false);
        }
        if let Some(stored) = self.ctx.storage.load_peer_topic(&peer)? {
            if let Err(e) = self.transport.add_peer_hint(&stored) {
                warn!(peer = %peer.short(), error = %e, "Ignoring peer address hint");
            }
        }

        let subscription = self.transport.subscribe(topic, vec![peer]).await?;
        let cancel = self.cancel.child_token();
        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&peer) {
                return Ok(false);
            }
            peers.insert(
                peer,
                PeerListener {
                    topic,
                    cancel: cancel.clone(),
                },
            );
        }

        let this = self.clone();
        self.track(tokio::spawn(this.peer_topic_loop(peer, subscription, cancel)));

        info!(peer = %peer.short(), topic = %topic.to_hex(), "Subscribed to peer topic");
        self.ctx.events.emit(SyncEvent::PeerSubscribed { peer });
        Ok(true)
    }

    /// Stop listening on `peer`'s topic.
    pub fn unsubscribe_peer(&self, peer: &NodeId) -> bool {
        match self.peers.lock().remove(peer) {
            Some(listener) => {
                debug!(peer = %peer.short(), topic = %listener.topic.to_hex(), "Unsubscribing from peer topic");
                listener.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// A neighbor joined our topic; give it our latest announcement.
    pub async fn on_peer_joined_own_topic(&self, peer: NodeId) -> SyncResult<()> {
        debug!(peer = %peer.short(), "Neighbor joined own topic");
        self.broadcast_current().await.map(|_| ())
    }

    /// Decode an announcement from `peer`'s topic and process it.
    pub async fn on_message_on_peer_topic(&self, peer: NodeId, content: &[u8]) -> ProcessingOutcome {
        match from_json::<Announcement>(content) {
            Ok(announcement) => self.protocol.on_announcement(&peer, &announcement).await,
            Err(e) => {
                warn!(peer = %peer.short(), len = content.len(), error = %e, "Dropping malformed announcement");
                ProcessingOutcome::Failed(e)
            }
        }
    }

    /// Sign `manifest` and broadcast it on our topic.
    pub async fn sign_and_broadcast(&self, manifest: &UserManifest) -> SyncResult<Announcement> {
        let sender = self.own_sender();
        self.protocol
            .sign_and_broadcast(manifest, sender.as_deref())
            .await
    }

    /// Send `announcement` on our topic.
    pub async fn broadcast_announcement(&self, announcement: &Announcement) -> SyncResult<()> {
        let Some(sender) = self.own_sender() else {
            debug!("Not subscribed to own topic, broadcast skipped");
            return Ok(());
        };
        sender.broadcast(Bytes::from(to_json(announcement)?)).await
    }

    /// Re-broadcast the last signed announcement, if any.
    pub async fn broadcast_current(&self) -> SyncResult<bool> {
        let Some(sender) = self.own_sender() else {
            return Ok(false);
        };
        let Some(announcement) = self.protocol.current_announcement()? else {
            return Ok(false);
        };
        if let Err(e) = sender.broadcast(Bytes::from(to_json(&announcement)?)).await {
            warn!(version = announcement.version, error = %e, "Re-broadcast failed");
            return Ok(false);
        }
        debug!(version = announcement.version, "Re-broadcast announcement");
        Ok(true)
    }

    /// Cancel every listener and close the transport.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down subscriptions");
        self.cancel.cancel();
        self.peers.lock().clear();
        *self.own_sender.write() = None;

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        self.transport.shutdown().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listener tasks
    // ═══════════════════════════════════════════════════════════════════════

    async fn own_topic_loop(self: Arc<Self>, mut subscription: TopicSubscription, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.events.recv() => event,
            };
            match event {
                Some(TopicEvent::NeighborUp(peer)) => {
                    self.ctx.events.emit(SyncEvent::PeerJoined { peer });
                    if let Err(e) = self.on_peer_joined_own_topic(peer).await {
                        warn!(peer = %peer.short(), error = %e, "Failed to answer new neighbor");
                    }
                }
                Some(TopicEvent::NeighborDown(peer)) => {
                    debug!(peer = %peer.short(), "Neighbor left own topic");
                    self.ctx.events.emit(SyncEvent::PeerLeft { peer });
                }
                Some(TopicEvent::Message { from, .. }) => {
                    debug!(from = %from.short(), "Ignoring message on own topic");
                }
                None => {
                    warn!("Own topic subscription closed");
                    break;
                }
            }
        }
        debug!("Own topic listener stopped");
    }

    /// Messages are attributed to the topic owner; the delivering neighbor
    /// may only be relaying.
    async fn peer_topic_loop(
        self: Arc<Self>,
        peer: NodeId,
        mut subscription: TopicSubscription,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.events.recv() => event,
            };
            match event {
                Some(TopicEvent::Message { content, .. }) => {
                    // A cancelled pass never reaches its commit step
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.on_message_on_peer_topic(peer, &content) => {}
                    }
                }
                Some(TopicEvent::NeighborUp(node)) => {
                    debug!(peer = %peer.short(), neighbor = %node.short(), "Neighbor up on peer topic");
                }
                Some(TopicEvent::NeighborDown(node)) => {
                    debug!(peer = %peer.short(), neighbor = %node.short(), "Neighbor down on peer topic");
                }
                None => {
                    warn!(peer = %peer.short(), "Peer topic subscription closed");
                    self.peers.lock().remove(&peer);
                    break;
                }
            }
        }
        debug!(peer = %peer.short(), "Peer topic listener stopped");
    }
}
