//! In-process blob stores
//!
//! A [`MemoryBlobNetwork`] links several [`MemoryBlobStore`]s by node id so
//! remote fetches can be exercised without sockets. Nodes can be taken
//! offline to simulate transport failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::types::{BlobHash, NodeId};

type BlobMap = Arc<RwLock<HashMap<BlobHash, Bytes>>>;

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<NodeId, BlobMap>,
    offline: HashSet<NodeId>,
}

/// Registry of in-memory stores reachable by node id.
#[derive(Clone, Default)]
pub struct MemoryBlobNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl MemoryBlobNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store for `node`, joined to this network.
    pub fn node(&self, node: NodeId) -> MemoryBlobStore {
        let blobs = self.inner.write().nodes.entry(node).or_default().clone();
        MemoryBlobStore {
            blobs,
            network: Some((self.clone(), node)),
            remote_fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make `node` unreachable (or reachable again).
    pub fn set_offline(&self, node: NodeId, offline: bool) {
        let mut inner = self.inner.write();
        if offline {
            inner.offline.insert(node);
        } else {
            inner.offline.remove(&node);
        }
    }

    fn lookup(&self, node: &NodeId, hash: &BlobHash) -> SyncResult<Option<Bytes>> {
        let inner = self.inner.read();
        if inner.offline.contains(node) {
            return Err(SyncError::TransportFailure(format!(
                "node {} is unreachable",
                node.short()
            )));
        }
        let blobs = inner
            .nodes
            .get(node)
            .ok_or_else(|| SyncError::TransportFailure(format!("no route to {}", node.short())))?;
        let data = blobs.read().get(hash).cloned();
        Ok(data)
    }
}

/// In-memory [`BlobStore`], standalone or attached to a network.
#[derive(Clone)]
pub struct MemoryBlobStore {
    blobs: BlobMap,
    network: Option<(MemoryBlobNetwork, NodeId)>,
    remote_fetches: Arc<AtomicUsize>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    /// Standalone store; remote gets fail.
    pub fn new() -> Self {
        Self {
            blobs: Arc::default(),
            network: None,
            remote_fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of blobs copied from peers so far.
    pub fn remote_fetches(&self) -> usize {
        self.remote_fetches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes) -> SyncResult<BlobHash> {
        let hash = BlobHash::of(&data);
        self.blobs.write().insert(hash.clone(), data);
        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash, from: Option<&NodeId>) -> SyncResult<Option<Bytes>> {
        if let Some(data) = self.blobs.read().get(hash).cloned() {
            return Ok(Some(data));
        }
        let Some(peer) = from else {
            return Ok(None);
        };
        let Some((network, local)) = &self.network else {
            return Err(SyncError::TransportFailure(
                "standalone memory store cannot fetch".to_string(),
            ));
        };
        if network.inner.read().offline.contains(local) {
            return Err(SyncError::TransportFailure("local node is offline".to_string()));
        }

        let data = network.lookup(peer, hash)?.ok_or_else(|| {
            SyncError::TransportFailure(format!("{} does not have blob {}", peer.short(), hash))
        })?;
        if BlobHash::of(&data) != *hash {
            return Err(SyncError::TransportFailure(format!(
                "blob {} failed verification",
                hash
            )));
        }
        self.remote_fetches.fetch_add(1, Ordering::SeqCst);
        self.blobs.write().insert(hash.clone(), data.clone());
        Ok(Some(data))
    }

    async fn has(&self, hash: &BlobHash) -> SyncResult<bool> {
        Ok(self.blobs.read().contains_key(hash))
    }

    async fn delete(&self, hash: &BlobHash) -> SyncResult<()> {
        self.blobs.write().remove(hash);
        Ok(())
    }
}
