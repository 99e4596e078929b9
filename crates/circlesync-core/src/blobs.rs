//! Content-addressed blob storage
//!
//! Every published object (manifests, posts, reactions, actions, files) is a
//! blob named by the BLAKE3 hash of its bytes. [`BlobStore`] is the seam the
//! sync layer talks to:
//!
//! - [`IrohBlobStore`]: iroh-blobs store, in memory or on disk, serving and
//!   fetching blobs over the endpoint
//! - [`memory::MemoryBlobStore`]: in-process store for tests and offline use
//!
//! `get` with a peer hint first looks locally, then downloads from that peer.
//! A blob that cannot be fetched is a `TransportFailure`.

pub mod memory;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use iroh::Endpoint;
use iroh_blobs::store::fs::options::Options as FsOptions;
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::{MemStore, Options as MemOptions};
use iroh_blobs::store::GcConfig;
use iroh_blobs::{Hash, HashAndFormat};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::{BlobHash, NodeId};

pub use memory::{MemoryBlobNetwork, MemoryBlobStore};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return their hash.
    async fn put(&self, data: Bytes) -> SyncResult<BlobHash>;

    /// Local bytes, or bytes fetched from `from` when given.
    ///
    /// `Ok(None)` only when the blob is absent locally and no peer was named.
    async fn get(&self, hash: &BlobHash, from: Option<&NodeId>) -> SyncResult<Option<Bytes>>;

    async fn has(&self, hash: &BlobHash) -> SyncResult<bool>;

    /// Drop a local blob. Missing blobs are not an error.
    async fn delete(&self, hash: &BlobHash) -> SyncResult<()>;

    /// Flush and stop the store. Later calls may fail.
    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Like [`BlobStore::get`] with a peer, but absence is an error.
pub async fn fetch_required(
    store: &dyn BlobStore,
    hash: &BlobHash,
    from: &NodeId,
) -> SyncResult<Bytes> {
    store.get(hash, Some(from)).await?.ok_or_else(|| {
        SyncError::TransportFailure(format!("blob {} not available from {}", hash, from.short()))
    })
}

/// How often iroh-blobs sweeps blobs no tag points at.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Every blob this store keeps is pinned by one named tag. Dropping the tag
/// in [`BlobStore::delete`] hands the blob to the garbage collector.
const TAG_PREFIX: &str = "circlesync/";

fn tag_name(hash: &Hash) -> String {
    format!("{}{}", TAG_PREFIX, hash.to_hex())
}

fn gc_config(interval: Duration) -> GcConfig {
    GcConfig {
        interval,
        add_protected: None,
    }
}

fn to_iroh_hash(hash: &BlobHash) -> SyncResult<Hash> {
    Ok(Hash::from_bytes(hash.to_bytes()?))
}

fn from_iroh_hash(hash: &Hash) -> BlobHash {
    BlobHash::from_bytes(hash.as_bytes())
}

// ═══════════════════════════════════════════════════════════════════════
// iroh-blobs
// ═══════════════════════════════════════════════════════════════════════

/// The underlying store type (memory or persistent)
enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreInner::Memory(_) => write!(f, "MemStore"),
            StoreInner::Persistent(_) => write!(f, "FsStore"),
        }
    }
}

/// Blob store backed by iroh-blobs.
///
/// Without an endpoint it behaves as a local-only store; remote `get`s then
/// fail with `TransportFailure`.
pub struct IrohBlobStore {
    inner: StoreInner,
    endpoint: Option<Endpoint>,
}

impl std::fmt::Debug for IrohBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohBlobStore")
            .field("store", &self.inner)
            .field("networked", &self.endpoint.is_some())
            .finish()
    }
}

impl IrohBlobStore {
    /// In-memory store, lost on restart.
    pub fn new_memory() -> Self {
        Self::new_memory_with_gc(DEFAULT_GC_INTERVAL)
    }

    /// In-memory store sweeping released blobs every `gc_interval`.
    pub fn new_memory_with_gc(gc_interval: Duration) -> Self {
        info!(?gc_interval, "Creating in-memory blob store");
        let store = MemStore::new_with_opts(MemOptions {
            gc_config: Some(gc_config(gc_interval)),
        });
        Self {
            inner: StoreInner::Memory(store),
            endpoint: None,
        }
    }

    /// FsStore rooted at `path`, created if missing.
    pub async fn new_persistent(path: &Path) -> SyncResult<Self> {
        Self::new_persistent_with_gc(path, DEFAULT_GC_INTERVAL).await
    }

    pub async fn new_persistent_with_gc(path: &Path, gc_interval: Duration) -> SyncResult<Self> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            SyncError::Blob(format!("Failed to create blob directory {:?}: {}", path, e))
        })?;

        info!(?path, ?gc_interval, "Creating persistent blob store");
        let mut options = FsOptions::new(path);
        options.gc = Some(gc_config(gc_interval));
        let store = FsStore::load_with_opts(path.join("blobs.db"), options)
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to load FsStore at {:?}: {}", path, e)))?;

        Ok(Self {
            inner: StoreInner::Persistent(store),
            endpoint: None,
        })
    }

    /// Enable remote fetches through `endpoint`.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.inner, StoreInner::Persistent(_))
    }

    /// The store as a trait object, for router and downloader integration.
    pub fn store(&self) -> iroh_blobs::api::Store {
        match &self.inner {
            StoreInner::Memory(store) => store.as_ref().clone(),
            StoreInner::Persistent(store) => (*store).clone().into(),
        }
    }

    /// Protocol handler serving this store to peers.
    pub fn protocol(&self) -> iroh_blobs::BlobsProtocol {
        iroh_blobs::BlobsProtocol::new(&self.store(), None)
    }

    async fn pin(&self, hash: Hash) -> SyncResult<()> {
        self.store()
            .tags()
            .set(tag_name(&hash), HashAndFormat::raw(hash))
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to tag blob {}: {}", hash, e)))
    }

    async fn unpin(&self, hash: Hash) -> SyncResult<u64> {
        self.store()
            .tags()
            .delete(tag_name(&hash))
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to untag blob {}: {}", hash, e)))
    }

    async fn has_local(&self, hash: Hash) -> SyncResult<bool> {
        let store = self.store();
        store
            .blobs()
            .has(hash)
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to check blob: {}", e)))
    }

    async fn read_local(&self, hash: Hash) -> SyncResult<Option<Bytes>> {
        if !self.has_local(hash).await? {
            return Ok(None);
        }
        let store = self.store();
        let data = store
            .blobs()
            .get_bytes(hash)
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to get blob: {}", e)))?;
        Ok(Some(data))
    }

    /// Drop the pin taken for a download that produced nothing.
    async fn release_failed(&self, hash: Hash) {
        if let Err(e) = self.unpin(hash).await {
            warn!(?hash, error = %e, "Failed to release pin of missing blob");
        }
    }

    async fn download(&self, hash: Hash, from: &NodeId) -> SyncResult<()> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            SyncError::TransportFailure("blob store has no network endpoint".to_string())
        })?;
        let peer = iroh::PublicKey::from_bytes(from.as_bytes())
            .map_err(|e| SyncError::UnknownPeer(format!("invalid node id {}: {}", from, e)))?;

        debug!(?hash, peer = %from.short(), "Downloading blob from peer");
        self.pin(hash).await?;
        let store = self.store();
        let downloader = store.downloader(endpoint);
        let mut stream = downloader
            .download(hash, vec![peer])
            .stream()
            .await
            .map_err(|e| SyncError::TransportFailure(format!("Failed to start download: {}", e)))?;

        use n0_future::StreamExt;
        while let Some(event) = stream.next().await {
            debug!(?hash, ?event, "Download progress");
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for IrohBlobStore {
    async fn put(&self, data: Bytes) -> SyncResult<BlobHash> {
        let len = data.len();
        let store = self.store();
        let temp = store
            .blobs()
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to import blob: {}", e)))?;

        let hash = temp.hash();
        self.pin(hash).await?;
        drop(temp);
        debug!(?hash, len, "Imported blob");
        Ok(from_iroh_hash(&hash))
    }

    async fn get(&self, hash: &BlobHash, from: Option<&NodeId>) -> SyncResult<Option<Bytes>> {
        let iroh_hash = to_iroh_hash(hash)?;
        if let Some(data) = self.read_local(iroh_hash).await? {
            return Ok(Some(data));
        }
        let Some(peer) = from else {
            return Ok(None);
        };

        let fetched = match self.download(iroh_hash, peer).await {
            Ok(()) => self.read_local(iroh_hash).await?,
            Err(e) => {
                self.release_failed(iroh_hash).await;
                return Err(e);
            }
        };
        match fetched {
            Some(data) => {
                info!(%hash, peer = %peer.short(), "Blob download complete");
                Ok(Some(data))
            }
            None => {
                self.release_failed(iroh_hash).await;
                Err(SyncError::TransportFailure(format!(
                    "blob {} could not be fetched from {}",
                    hash,
                    peer.short()
                )))
            }
        }
    }

    async fn has(&self, hash: &BlobHash) -> SyncResult<bool> {
        self.has_local(to_iroh_hash(hash)?).await
    }

    async fn delete(&self, hash: &BlobHash) -> SyncResult<()> {
        let removed = self.unpin(to_iroh_hash(hash)?).await?;
        debug!(%hash, removed, "Released blob for garbage collection");
        Ok(())
    }

    async fn close(&self) -> SyncResult<()> {
        self.store()
            .shutdown()
            .await
            .map_err(|e| SyncError::Blob(format!("Failed to shut down blob store: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iroh_hash_matches_blob_hash() {
        let store = IrohBlobStore::new_memory();
        let data = Bytes::from_static(b"hello circles");
        let hash = store.put(data.clone()).await.unwrap();

        assert_eq!(hash, BlobHash::of(&data));
        assert!(store.has(&hash).await.unwrap());
        assert_eq!(store.get(&hash, None).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let store = IrohBlobStore::new_memory();
        let hash = BlobHash::of(b"never stored");
        assert!(!store.has(&hash).await.unwrap());
        assert_eq!(store.get(&hash, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_get_without_endpoint_is_transport_failure() {
        let store = IrohBlobStore::new_memory();
        let peer = NodeId::from_bytes([1u8; 32]);
        let err = store
            .get(&BlobHash::of(b"remote"), Some(&peer))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransportFailure(_)));
    }

    async fn wait_until_gone(store: &IrohBlobStore, hash: &BlobHash) -> bool {
        for _ in 0..100 {
            if !store.has(hash).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_deleted_blob_is_reclaimed() {
        let store = IrohBlobStore::new_memory_with_gc(Duration::from_millis(20));
        let doomed = store.put(Bytes::from_static(b"deleted post")).await.unwrap();
        let kept = store.put(Bytes::from_static(b"kept post")).await.unwrap();

        store.delete(&doomed).await.unwrap();
        assert!(wait_until_gone(&store, &doomed).await);
        assert!(store.has(&kept).await.unwrap());
        assert_eq!(store.get(&doomed, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deleted_blob_is_reclaimed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrohBlobStore::new_persistent_with_gc(&dir.path().join("blobs"), Duration::from_millis(20))
            .await
            .unwrap();
        let doomed = store.put(Bytes::from_static(b"cached file")).await.unwrap();
        let kept = store.put(Bytes::from_static(b"other file")).await.unwrap();

        store.delete(&doomed).await.unwrap();
        assert!(wait_until_gone(&store, &doomed).await);
        assert!(store.has(&kept).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_unknown_blob_is_ok() {
        let store = IrohBlobStore::new_memory();
        store.delete(&BlobHash::of(b"never stored")).await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = IrohBlobStore::new_persistent(&dir.path().join("blobs"))
            .await
            .unwrap();
        assert!(store.is_persistent());
        let hash = store.put(Bytes::from_static(b"on disk")).await.unwrap();
        assert!(store.has(&hash).await.unwrap());
    }
}
