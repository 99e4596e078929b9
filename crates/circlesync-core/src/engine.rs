//! CircleSyncEngine - the primary entry point for CircleSync
//!
//! CircleSyncEngine coordinates Storage, the key ring, the blob store and
//! gossip subscriptions for:
//! - Profiles, circles and circle membership
//! - Posts, attachments and reactions sealed per circle
//! - Manifest publishing and following introduced peers
//!
//! # Example
//!
//! ```ignore
//! use circlesync_core::{CircleSyncEngine, SyncConfig};
//!
//! let engine = CircleSyncEngine::open_with_iroh(SyncConfig::default()).await?;
//! engine.onboard("alice")?;
//!
//! let friends = engine.create_circle("friends")?;
//! engine.introduce_peer(bob, None, vec![], None).await?;
//! engine.add_member(friends.id, &bob)?;
//! engine.create_post(friends.id, "hello", None, vec![]).await?;
//!
//! engine.start().await?;
//! engine.publish().await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blobs::{BlobStore, IrohBlobStore};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::NodeKeypair;
use crate::keys::{wrap_key_for_peer, KeyHandle};
use crate::storage::Storage;
use crate::sync::{
    GossipTransport, IrohGossip, ManifestProtocol, MemoryGossipHub, ProcessingOutcome,
    SubscriptionManager, SyncContext, SyncEvent,
};
use crate::types::{
    now_millis, ActionKind, BlobHash, Circle, CircleId, FileRef, Identity, NodeId,
    OutboundAction, PeerTopic, Post, PostId, Reaction, TopicKey,
};
use crate::wire::Announcement;

/// Summary of this node for display and out-of-band introduction.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub topic_key: TopicKey,
    pub display_name: Option<String>,
    pub addresses: Vec<String>,
    pub relay_url: Option<String>,
    /// Last signed manifest version, 0 if never published
    pub version: u64,
}

pub struct CircleSyncEngine {
    ctx: SyncContext,
    protocol: Arc<ManifestProtocol>,
    subscriptions: Arc<SubscriptionManager>,
    transport: Arc<dyn GossipTransport>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CircleSyncEngine {
    /// Assemble an engine from its parts.
    ///
    /// `transport` must belong to the same node as `keypair`.
    pub fn open(
        config: SyncConfig,
        storage: Storage,
        keypair: NodeKeypair,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn GossipTransport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        if transport.local_node() != keypair.node_id() {
            return Err(SyncError::InvalidOperation(
                "transport is bound to a different node".to_string(),
            ));
        }

        let ctx = SyncContext::new(storage, blobs, Arc::new(keypair), Arc::new(config));
        let protocol = Arc::new(ManifestProtocol::new(ctx.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(
            ctx.clone(),
            protocol.clone(),
            transport.clone(),
        ));
        info!(node = %ctx.node_id().short(), "Opened CircleSyncEngine");

        Ok(Self {
            ctx,
            protocol,
            subscriptions,
            transport,
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Open the data directory and bind an iroh endpoint serving gossip and
    /// blobs under the node's persisted key.
    pub async fn open_with_iroh(config: SyncConfig) -> SyncResult<Self> {
        let (storage, keypair) = Self::open_storage(&config)?;
        let store = Self::open_blob_store(&config).await?;
        let gossip =
            IrohGossip::bind(&keypair, Some(&store), config.gossip_max_message_size).await?;
        let store = store.with_endpoint(gossip.endpoint().clone());
        Self::open(config, storage, keypair, Arc::new(store), Arc::new(gossip))
    }

    /// Open the data directory without networking, for local edits.
    pub async fn open_offline(config: SyncConfig) -> SyncResult<Self> {
        let (storage, keypair) = Self::open_storage(&config)?;
        let store = Self::open_blob_store(&config).await?;
        let transport = MemoryGossipHub::new().node(keypair.node_id());
        Self::open(config, storage, keypair, Arc::new(store), Arc::new(transport))
    }

    fn open_storage(config: &SyncConfig) -> SyncResult<(Storage, NodeKeypair)> {
        config.validate()?;
        info!(data_dir = ?config.data_dir, "Initializing storage");
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::new(config.db_path())?;

        let keypair = match storage.load_node_seed()? {
            Some(seed) => NodeKeypair::from_seed(&seed),
            None => {
                let keypair = NodeKeypair::generate();
                storage.save_node_seed(&keypair.to_seed_bytes())?;
                info!(node = %keypair.node_id().short(), "Generated node key");
                keypair
            }
        };
        Ok((storage, keypair))
    }

    async fn open_blob_store(config: &SyncConfig) -> SyncResult<IrohBlobStore> {
        if config.persistent_blobs {
            IrohBlobStore::new_persistent_with_gc(&config.blobs_dir(), config.blob_gc_interval()).await
        } else {
            Ok(IrohBlobStore::new_memory_with_gc(config.blob_gc_interval()))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn own_topic_key(&self) -> TopicKey {
        TopicKey::for_node(&self.node_id())
    }

    pub fn storage(&self) -> &Storage {
        &self.ctx.storage
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn local_identity(&self) -> SyncResult<Identity> {
        self.ctx.local_identity()
    }

    pub fn info(&self) -> SyncResult<NodeInfo> {
        let (addresses, relay_url) = self.transport.local_addresses();
        Ok(NodeInfo {
            node_id: self.node_id(),
            topic_key: self.own_topic_key(),
            display_name: self
                .ctx
                .storage
                .find_identity_by_owner(&self.node_id())?
                .map(|i| i.display_name),
            addresses,
            relay_url,
            version: self.ctx.storage.load_sync_state()?.version,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profile
    // ═══════════════════════════════════════════════════════════════════════

    /// Create the local identity and the keyed "everyone" circle.
    ///
    /// Calling it again renames the identity and repairs a missing circle
    /// or key.
    pub fn onboard(&self, display_name: &str) -> SyncResult<Identity> {
        let me = self.node_id();
        let identity = match self.ctx.storage.find_identity_by_owner(&me)? {
            Some(mut existing) => {
                if existing.display_name != display_name {
                    existing.display_name = display_name.to_string();
                    existing.self_blob_hash = None;
                    self.ctx.storage.update_identity(&existing)?;
                }
                existing
            }
            None => self
                .ctx
                .storage
                .insert_identity(&Identity::new(me, display_name))?,
        };

        let everyone = match self.ctx.storage.everyone_circle()? {
            Some(circle) => circle,
            None => self
                .ctx
                .storage
                .insert_circle(&Circle::everyone(identity.id))?,
        };
        if let Err(SyncError::NotFound(_)) = self.ctx.keys.key_for_circle(everyone.id) {
            self.ctx.keys.generate_circle_key(everyone.id)?;
        }

        info!(name = %identity.display_name, "Onboarded");
        Ok(identity)
    }

    pub fn set_display_name(&self, display_name: &str) -> SyncResult<Identity> {
        let mut identity = self.local_identity()?;
        identity.display_name = display_name.to_string();
        identity.self_blob_hash = None;
        self.ctx.storage.update_identity(&identity)?;
        Ok(identity)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Circles
    // ═══════════════════════════════════════════════════════════════════════

    pub fn create_circle(&self, name: &str) -> SyncResult<Circle> {
        let me = self.local_identity()?;
        let circle = self.ctx.storage.insert_circle(&Circle::new(name, me.id))?;
        self.ctx.keys.generate_circle_key(circle.id)?;
        info!(circle = circle.id, name, "Created circle");
        Ok(circle)
    }

    pub fn delete_circle(&self, circle: CircleId) -> SyncResult<()> {
        self.ctx.storage.delete_circle(circle)?;
        self.ctx.storage.retire_key_actions(circle, None)?;
        let removed = self
            .ctx
            .storage
            .delete_keys(&crate::keys::KeySubject::Circle(circle).to_string())?;
        debug!(circle, keys = removed, "Deleted circle");
        Ok(())
    }

    pub fn list_circles(&self) -> SyncResult<Vec<Circle>> {
        self.ctx.storage.list_circles()
    }

    fn require_circle(&self, circle: CircleId) -> SyncResult<Circle> {
        self.ctx
            .storage
            .load_circle(circle)?
            .ok_or_else(|| SyncError::NotFound(format!("circle {}", circle)))
    }

    pub fn circle_members(&self, circle: CircleId) -> SyncResult<Vec<Identity>> {
        let mut members = Vec::new();
        for id in self.ctx.storage.list_circle_members(circle)? {
            if let Some(identity) = self.ctx.storage.load_identity(id)? {
                members.push(identity);
            }
        }
        Ok(members)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Membership & keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Add `peer` to `circle` and queue the circle key for them.
    pub fn add_member(&self, circle: CircleId, peer: &NodeId) -> SyncResult<bool> {
        self.require_circle(circle)?;
        if *peer == self.node_id() {
            return Err(SyncError::InvalidOperation(
                "cannot add this node to its own circle".to_string(),
            ));
        }

        let identity = self.ctx.storage.ensure_identity(peer)?;
        if !self.ctx.storage.add_circle_member(circle, identity.id)? {
            return Ok(false);
        }
        self.share_circle_key(circle, peer)?;
        self.ctx.storage.invalidate_circle_manifest(circle)?;
        info!(circle, peer = %peer.short(), "Added member");
        Ok(true)
    }

    /// Remove `peer` from `circle` and rotate its key.
    pub async fn remove_member(&self, circle: CircleId, peer: &NodeId) -> SyncResult<bool> {
        self.require_circle(circle)?;
        let Some(identity) = self.ctx.storage.find_identity_by_owner(peer)? else {
            return Ok(false);
        };
        if !self.ctx.storage.remove_circle_member(circle, identity.id)? {
            return Ok(false);
        }
        self.ctx.storage.retire_key_actions(circle, Some(peer))?;
        info!(circle, peer = %peer.short(), "Removed member");
        self.rotate_circle_key(circle).await?;
        Ok(true)
    }

    /// Replace the circle key, re-seal own content under it on the next
    /// publish and send the new key to every remaining member.
    pub async fn rotate_circle_key(&self, circle: CircleId) -> SyncResult<KeyHandle> {
        self.require_circle(circle)?;
        let handle = self.ctx.keys.rotate_circle_key(circle)?;
        let me = self.local_identity()?;

        let mut resealed = 0;
        for mut post in self.ctx.storage.list_posts_in_circle(me.id, circle)? {
            if post.blob_hash.take().is_some() {
                self.ctx.storage.update_post(&post)?;
                resealed += 1;
            }
        }
        for mut reaction in self.ctx.storage.list_reactions_by_author(&me.owner_node_id)? {
            if reaction.circle_id == Some(circle) && reaction.blob_hash.take().is_some() {
                self.ctx.storage.update_reaction(&reaction)?;
                resealed += 1;
            }
        }

        let mut shared = 0;
        for member in self.circle_members(circle)? {
            if member.owner_node_id == me.owner_node_id {
                continue;
            }
            self.share_circle_key(circle, &member.owner_node_id)?;
            shared += 1;
        }
        self.ctx.storage.invalidate_circle_manifest(circle)?;

        info!(circle, key_id = handle.id, resealed, shared, "Rotated circle key");
        Ok(handle)
    }

    fn share_circle_key(&self, circle: CircleId, peer: &NodeId) -> SyncResult<()> {
        let raw = self.ctx.keys.key_for_circle(circle)?;
        let wrapped = wrap_key_for_peer(&raw, &self.ctx.keypair, peer)?;
        self.ctx.storage.queue_action(&OutboundAction::new(
            *peer,
            ActionKind::UpdateKey,
            wrapped,
            Some(circle),
        ))?;
        debug!(circle, peer = %peer.short(), "Queued circle key");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Content
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a post and its attachments locally. It is sealed on the next
    /// publish.
    pub async fn create_post(
        &self,
        circle: CircleId,
        text: &str,
        parent: Option<BlobHash>,
        files: Vec<(String, Bytes)>,
    ) -> SyncResult<Post> {
        self.require_circle(circle)?;
        let me = self.local_identity()?;

        let mut refs = Vec::with_capacity(files.len());
        for (mime_type, data) in files {
            let hash = self.ctx.blobs.put(data).await?;
            refs.push(FileRef::local(mime_type, hash));
        }

        let post = self.ctx.storage.insert_post(&Post {
            id: 0,
            author_identity_id: me.id,
            blob_hash: None,
            timestamp: now_millis(),
            parent_hash: parent,
            text: text.to_string(),
            signature: String::new(),
            files: refs,
            circle_id: Some(circle),
        })?;
        self.ctx.storage.invalidate_circle_manifest(circle)?;
        debug!(post = post.id, circle, files = post.files.len(), "Created post");
        Ok(post)
    }

    /// Delete an own post locally and ask the circle's members to drop it.
    pub async fn delete_post(&self, post_id: PostId) -> SyncResult<()> {
        let me = self.local_identity()?;
        let post = self
            .ctx
            .storage
            .load_post(post_id)?
            .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
        if post.author_identity_id != me.id {
            return Err(SyncError::InvalidOperation(
                "only the author can delete a post".to_string(),
            ));
        }

        if let (Some(hash), Some(circle)) = (&post.blob_hash, post.circle_id) {
            for member in self.circle_members(circle)? {
                if member.owner_node_id == me.owner_node_id {
                    continue;
                }
                self.ctx.storage.queue_action(&OutboundAction::new(
                    member.owner_node_id,
                    ActionKind::Delete,
                    hash.as_str(),
                    Some(circle),
                ))?;
            }
        }

        self.ctx.storage.delete_post(post.id)?;
        for file in &post.files {
            for hash in file.blob_hash.iter().chain(file.local_hash.iter()) {
                self.ctx.blobs.delete(hash).await?;
            }
        }
        if let Some(hash) = &post.blob_hash {
            self.ctx.blobs.delete(hash).await?;
        }
        if let Some(circle) = post.circle_id {
            self.ctx.storage.invalidate_circle_manifest(circle)?;
        }
        info!(post = post.id, "Deleted post");
        Ok(())
    }

    /// React to a known post. Reactions to own posts go to the post's
    /// circle; reactions to others' posts go to "everyone".
    pub fn react(&self, post_hash: &BlobHash, emoji: &str) -> SyncResult<Reaction> {
        let me = self.local_identity()?;
        let post = self
            .ctx
            .storage
            .find_post_by_hash(post_hash)?
            .ok_or_else(|| SyncError::NotFound(format!("post {}", post_hash)))?;

        let circle = match post.circle_id {
            Some(circle) if post.author_identity_id == me.id => circle,
            _ => {
                self.ctx
                    .storage
                    .everyone_circle()?
                    .ok_or_else(|| SyncError::NotFound("everyone circle".to_string()))?
                    .id
            }
        };

        let reaction = self.ctx.storage.upsert_reaction(&Reaction {
            id: 0,
            post_hash: post_hash.clone(),
            author_node_id: me.owner_node_id,
            emoji: emoji.to_string(),
            timestamp: now_millis(),
            signature: String::new(),
            blob_hash: None,
            circle_id: Some(circle),
            removed: false,
        })?;
        self.ctx.storage.invalidate_circle_manifest(circle)?;
        Ok(reaction)
    }

    /// Withdraw a reaction. A tombstone is published in its place.
    pub fn unreact(&self, post_hash: &BlobHash, emoji: &str) -> SyncResult<bool> {
        let Some(mut reaction) = self
            .ctx
            .storage
            .find_reaction(post_hash, &self.node_id(), emoji)?
        else {
            return Ok(false);
        };
        if reaction.removed {
            return Ok(false);
        }
        reaction.removed = true;
        reaction.blob_hash = None;
        reaction.timestamp = now_millis();
        self.ctx.storage.update_reaction(&reaction)?;
        if let Some(circle) = reaction.circle_id {
            self.ctx.storage.invalidate_circle_manifest(circle)?;
        }
        Ok(true)
    }

    /// Every post, newest first.
    pub fn list_posts(&self) -> SyncResult<Vec<Post>> {
        let mut posts = self.ctx.storage.list_posts()?;
        posts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(posts)
    }

    pub fn list_reactions(&self, post_hash: &BlobHash) -> SyncResult<Vec<Reaction>> {
        Ok(self
            .ctx
            .storage
            .list_reactions_for_post(post_hash)?
            .into_iter()
            .filter(|r| !r.removed)
            .collect())
    }

    /// Plaintext of an attachment that has been fetched.
    pub async fn read_file(&self, file: &FileRef) -> SyncResult<Option<Bytes>> {
        match &file.local_hash {
            Some(hash) => self.ctx.blobs.get(hash, None).await,
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    /// Record an out-of-band introduction and follow the peer.
    ///
    /// The peer joins "everyone" and receives its key. Re-introducing a known
    /// peer refreshes its addresses and keeps its sync progress.
    pub async fn introduce_peer(
        &self,
        peer: NodeId,
        topic_key: Option<TopicKey>,
        addresses: Vec<String>,
        relay_url: Option<String>,
    ) -> SyncResult<PeerTopic> {
        if peer == self.node_id() {
            return Err(SyncError::InvalidOperation(
                "cannot introduce this node to itself".to_string(),
            ));
        }
        let topic_key = topic_key.unwrap_or_else(|| TopicKey::for_node(&peer));
        let topic = match self.ctx.storage.load_peer_topic(&peer)? {
            Some(mut existing) => {
                existing.topic_key = topic_key;
                existing.addresses = addresses;
                existing.relay_url = relay_url;
                existing
            }
            None => PeerTopic::new(peer, topic_key)
                .with_addresses(addresses)
                .with_relay_url(relay_url),
        };
        let topic = self.ctx.storage.save_peer_topic(&topic)?;
        self.ctx.keys.store_public_key(&peer)?;
        self.ctx.storage.ensure_identity(&peer)?;

        if let Some(everyone) = self.ctx.storage.everyone_circle()? {
            self.add_member(everyone.id, &peer)?;
        }

        if self.subscriptions.is_started() {
            if let Err(e) = self
                .subscriptions
                .subscribe_to_new_peer(peer, topic.topic_key)
                .await
            {
                warn!(peer = %peer.short(), error = %e, "Failed to subscribe to introduced peer");
            }
        }
        info!(peer = %peer.short(), "Introduced peer");
        Ok(topic)
    }

    pub fn list_peers(&self) -> SyncResult<Vec<PeerTopic>> {
        self.ctx.storage.list_peer_topics()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish pending content, sign the next manifest and broadcast it.
    pub async fn publish(&self) -> SyncResult<Announcement> {
        let manifest = self.protocol.build_manifest().await?;
        self.subscriptions.sign_and_broadcast(&manifest).await
    }

    /// Process an announcement received out of band.
    pub async fn process_announcement(
        &self,
        peer: &NodeId,
        announcement: &Announcement,
    ) -> ProcessingOutcome {
        self.protocol.on_announcement(peer, announcement).await
    }

    /// Retry attachments that failed to download. Returns how many were
    /// recovered.
    pub async fn run_maintenance(&self) -> SyncResult<usize> {
        let recovered = self.protocol.downloader().retry_missing_files().await?;
        if recovered > 0 {
            info!(recovered, "Recovered attachments");
        }
        Ok(recovered)
    }

    /// Join gossip topics and start periodic re-broadcast.
    pub async fn start(&self) -> SyncResult<()> {
        self.subscriptions.start().await?;

        if let Some(period) = self.ctx.config.republish_interval() {
            let subscriptions = self.subscriptions.clone();
            let cancel = self.cancel.child_token();
            self.background.lock().push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = subscriptions.broadcast_current().await {
                                warn!(error = %e, "Periodic re-broadcast failed");
                            }
                        }
                    }
                }
            }));
            debug!(?period, "Periodic re-broadcast started");
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.subscriptions.is_started()
    }

    /// Gracefully shutdown the engine
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down CircleSyncEngine");
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.subscriptions.shutdown().await?;
        self.ctx.blobs.close().await?;
        info!("CircleSyncEngine shutdown complete");
        Ok(())
    }
}
