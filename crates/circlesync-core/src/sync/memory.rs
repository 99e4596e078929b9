//! In-process gossip hub
//!
//! Delivers broadcasts to every other subscriber of the same topic and
//! reports neighbors as they subscribe. Offline nodes neither send nor
//! receive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::gossip::{GossipTransport, TopicBroadcaster, TopicEvent, TopicSubscription};
use crate::error::SyncResult;
use crate::types::{NodeId, TopicKey};

type Subscribers = Vec<(NodeId, mpsc::UnboundedSender<TopicEvent>)>;

#[derive(Default)]
struct HubInner {
    topics: HashMap<TopicKey, Subscribers>,
    offline: HashSet<NodeId>,
}

#[derive(Clone, Default)]
pub struct MemoryGossipHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryGossipHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for `node` on this hub.
    pub fn node(&self, node: NodeId) -> MemoryGossip {
        MemoryGossip {
            hub: self.clone(),
            node,
        }
    }

    pub fn set_offline(&self, node: NodeId, offline: bool) {
        let mut inner = self.inner.lock();
        if offline {
            inner.offline.insert(node);
        } else {
            inner.offline.remove(&node);
        }
    }

    /// Live subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &TopicKey) -> usize {
        let mut inner = self.inner.lock();
        match inner.topics.get_mut(topic) {
            Some(subs) => {
                subs.retain(|(_, tx)| !tx.is_closed());
                subs.len()
            }
            None => 0,
        }
    }
}

/// One node's view of a [`MemoryGossipHub`].
#[derive(Clone)]
pub struct MemoryGossip {
    hub: MemoryGossipHub,
    node: NodeId,
}

struct MemoryTopicSender {
    hub: MemoryGossipHub,
    topic: TopicKey,
    node: NodeId,
}

#[async_trait]
impl TopicBroadcaster for MemoryTopicSender {
    async fn broadcast(&self, data: Bytes) -> SyncResult<()> {
        let mut inner = self.hub.inner.lock();
        if inner.offline.contains(&self.node) {
            return Ok(());
        }
        let offline = inner.offline.clone();
        if let Some(subs) = inner.topics.get_mut(&self.topic) {
            subs.retain(|(_, tx)| !tx.is_closed());
            for (node, tx) in subs.iter() {
                if *node == self.node || offline.contains(node) {
                    continue;
                }
                let _ = tx.send(TopicEvent::Message {
                    from: self.node,
                    content: data.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GossipTransport for MemoryGossip {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn subscribe(
        &self,
        topic: TopicKey,
        _bootstrap: Vec<NodeId>,
    ) -> SyncResult<TopicSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.hub.inner.lock();
            let subs = inner.topics.entry(topic).or_default();
            subs.retain(|(node, existing)| !existing.is_closed() && *node != self.node);
            for (node, existing) in subs.iter() {
                let _ = existing.send(TopicEvent::NeighborUp(self.node));
                let _ = tx.send(TopicEvent::NeighborUp(*node));
            }
            subs.push((self.node, tx));
        }

        Ok(TopicSubscription {
            sender: Arc::new(MemoryTopicSender {
                hub: self.hub.clone(),
                topic,
                node: self.node,
            }),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[tokio::test]
    async fn test_neighbors_and_delivery() {
        let hub = MemoryGossipHub::new();
        let topic = TopicKey::for_node(&node(1));

        let mut a = hub.node(node(1)).subscribe(topic, vec![]).await.unwrap();
        let mut b = hub.node(node(2)).subscribe(topic, vec![node(1)]).await.unwrap();

        assert_eq!(a.events.recv().await, Some(TopicEvent::NeighborUp(node(2))));
        assert_eq!(b.events.recv().await, Some(TopicEvent::NeighborUp(node(1))));

        a.sender.broadcast(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(TopicEvent::Message {
                from: node(1),
                content: Bytes::from_static(b"hi")
            })
        );
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_receiver_misses_messages() {
        let hub = MemoryGossipHub::new();
        let topic = TopicKey::for_node(&node(1));
        let a = hub.node(node(1)).subscribe(topic, vec![]).await.unwrap();
        let mut b = hub.node(node(2)).subscribe(topic, vec![]).await.unwrap();
        let _ = b.events.recv().await;

        hub.set_offline(node(2), true);
        a.sender.broadcast(Bytes::from_static(b"lost")).await.unwrap();
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let hub = MemoryGossipHub::new();
        let topic = TopicKey::for_node(&node(1));
        let a = hub.node(node(1)).subscribe(topic, vec![]).await.unwrap();
        let b = hub.node(node(2)).subscribe(topic, vec![]).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 2);

        drop(b);
        a.sender.broadcast(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 1);
    }
}
