//! Gossip transport
//!
//! Each node owns one topic and broadcasts announcements on it; followers
//! subscribe to the topics of the peers they were introduced to.
//! [`GossipTransport`] hides the network so the subscription manager can run
//! over iroh-gossip or over the in-process hub in [`super::memory`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, PublicKey, RelayUrl};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::blobs::IrohBlobStore;
use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::types::{NodeId, PeerTopic, TopicKey};

/// Event from a gossip topic (message or neighbor change)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// `from` is the neighbor that delivered the message, not necessarily
    /// its author
    Message { from: NodeId, content: Bytes },
    NeighborUp(NodeId),
    NeighborDown(NodeId),
}

#[async_trait]
pub trait TopicBroadcaster: Send + Sync {
    async fn broadcast(&self, data: Bytes) -> SyncResult<()>;
}

/// A live topic subscription. Dropping `events` ends it.
pub struct TopicSubscription {
    pub sender: Arc<dyn TopicBroadcaster>,
    pub events: mpsc::UnboundedReceiver<TopicEvent>,
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Direct addresses and relay URL others can dial us on.
    fn local_addresses(&self) -> (Vec<String>, Option<String>) {
        (Vec::new(), None)
    }

    /// Make a peer's stored addresses known before dialing it.
    fn add_peer_hint(&self, _peer: &PeerTopic) -> SyncResult<()> {
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: TopicKey,
        bootstrap: Vec<NodeId>,
    ) -> SyncResult<TopicSubscription>;

    async fn shutdown(&self) -> SyncResult<()> {
        Ok(())
    }
}

fn to_public_key(node: &NodeId) -> SyncResult<PublicKey> {
    PublicKey::from_bytes(node.as_bytes())
        .map_err(|e| SyncError::UnknownPeer(format!("invalid node id {}: {}", node, e)))
}

fn from_public_key(key: &PublicKey) -> NodeId {
    NodeId::from_bytes(*key.as_bytes())
}

// ═══════════════════════════════════════════════════════════════════════
// iroh-gossip
// ═══════════════════════════════════════════════════════════════════════

struct IrohTopicSender {
    sender: Mutex<iroh_gossip::api::GossipSender>,
    topic: TopicKey,
}

#[async_trait]
impl TopicBroadcaster for IrohTopicSender {
    async fn broadcast(&self, data: Bytes) -> SyncResult<()> {
        debug!(topic = ?self.topic, len = data.len(), "Broadcasting message");
        self.sender
            .lock()
            .await
            .broadcast(data)
            .await
            .map_err(|e| SyncError::Gossip(format!("Failed to broadcast: {}", e)))
    }
}

/// iroh endpoint with gossip and blob protocols.
#[derive(Debug)]
pub struct IrohGossip {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    node_id: NodeId,
}

impl IrohGossip {
    /// Bind an endpoint under the node's key and spawn the router.
    ///
    /// When `blobs` is given its store is served on the blobs ALPN.
    pub async fn bind(
        keypair: &NodeKeypair,
        blobs: Option<&IrohBlobStore>,
        max_message_size: usize,
    ) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();

        let mut alpns = vec![GOSSIP_ALPN.to_vec()];
        if blobs.is_some() {
            alpns.push(iroh_blobs::ALPN.to_vec());
        }

        let endpoint = Endpoint::builder()
            .secret_key(keypair.iroh_secret_key())
            .alpns(alpns)
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(max_message_size)
            .spawn(endpoint.clone());
        info!(max_message_size, "Gossip spawned");

        let mut router_builder =
            Router::builder(endpoint.clone()).accept(GOSSIP_ALPN, gossip.clone());
        if let Some(store) = blobs {
            router_builder = router_builder.accept(iroh_blobs::ALPN, store.protocol());
            info!("Blob protocol registered");
        }
        let router = router_builder.spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            node_id: keypair.node_id(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn peer_addr(peer: &PeerTopic) -> SyncResult<EndpointAddr> {
        let mut addr = EndpointAddr::new(to_public_key(&peer.peer_node_id)?);
        if let Some(relay) = &peer.relay_url {
            match relay.parse::<RelayUrl>() {
                Ok(url) => addr = addr.with_relay_url(url),
                Err(e) => warn!(peer = %peer.peer_node_id.short(), %relay, error = %e, "Skipping bad relay URL"),
            }
        }
        for raw in &peer.addresses {
            match raw.parse::<SocketAddr>() {
                Ok(socket) => addr = addr.with_ip_addr(socket),
                Err(e) => warn!(peer = %peer.peer_node_id.short(), address = %raw, error = %e, "Skipping bad address"),
            }
        }
        Ok(addr)
    }
}

/// Forward gossip events into an unbounded channel until either side closes.
async fn forward_events(
    mut receiver: iroh_gossip::api::GossipReceiver,
    tx: mpsc::UnboundedSender<TopicEvent>,
    topic: TopicKey,
) {
    use iroh_gossip::api::Event;
    use n0_future::StreamExt;

    loop {
        let event = match receiver.try_next().await {
            Ok(Some(Event::Received(msg))) => {
                debug!(?topic, from = ?msg.delivered_from, "Received message");
                TopicEvent::Message {
                    from: from_public_key(&msg.delivered_from),
                    content: msg.content,
                }
            }
            Ok(Some(Event::NeighborUp(peer))) => {
                info!(?topic, ?peer, "Neighbor joined");
                TopicEvent::NeighborUp(from_public_key(&peer))
            }
            Ok(Some(Event::NeighborDown(peer))) => {
                info!(?topic, ?peer, "Neighbor left");
                TopicEvent::NeighborDown(from_public_key(&peer))
            }
            Ok(Some(Event::Lagged)) => {
                warn!(?topic, "Lagged behind on topic");
                continue;
            }
            Ok(None) => {
                debug!(?topic, "Topic subscription closed");
                return;
            }
            Err(e) => {
                warn!(?topic, error = ?e, "Error receiving from topic");
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

#[async_trait]
impl GossipTransport for IrohGossip {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn local_addresses(&self) -> (Vec<String>, Option<String>) {
        let addr = self.endpoint.addr();
        let direct = addr.ip_addrs().map(|a| a.to_string()).collect();
        let relay = addr.relay_urls().next().map(|u| u.to_string());
        (direct, relay)
    }

    fn add_peer_hint(&self, peer: &PeerTopic) -> SyncResult<()> {
        let addr = Self::peer_addr(peer)?;
        info!(
            peer = %peer.peer_node_id.short(),
            addrs = addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(addr);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: TopicKey,
        bootstrap: Vec<NodeId>,
    ) -> SyncResult<TopicSubscription> {
        info!(?topic, peer_count = bootstrap.len(), "Subscribing to topic");
        let bootstrap = bootstrap
            .iter()
            .filter(|n| **n != self.node_id)
            .map(to_public_key)
            .collect::<SyncResult<Vec<_>>>()?;

        let (sender, receiver) = self
            .gossip
            .subscribe(topic.to_topic_id(), bootstrap)
            .await
            .map_err(|e| SyncError::Gossip(format!("Failed to subscribe: {}", e)))?
            .split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(receiver, tx, topic));

        Ok(TopicSubscription {
            sender: Arc::new(IrohTopicSender {
                sender: Mutex::new(sender),
                topic,
            }),
            events: rx,
        })
    }

    async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down gossip transport");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_skips_bad_entries() {
        let node = NodeKeypair::generate().node_id();
        let topic = PeerTopic::new(node, TopicKey::for_node(&node))
            .with_addresses(vec!["127.0.0.1:4433".to_string(), "not an address".to_string()])
            .with_relay_url(Some("https://relay.example.com".to_string()));
        let addr = IrohGossip::peer_addr(&topic).unwrap();
        assert_eq!(addr.ip_addrs().count(), 1);
        assert_eq!(addr.relay_urls().count(), 1);
    }

    #[test]
    fn test_public_key_conversion() {
        let node = NodeKeypair::generate().node_id();
        let key = to_public_key(&node).unwrap();
        assert_eq!(from_public_key(&key), node);
    }
}
