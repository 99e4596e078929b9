//! Manifest/announcement protocol
//!
//! A node summarizes everything it publishes in a [`UserManifest`], stores
//! it as a blob and broadcasts a signed [`Announcement`] pointing at it.
//! Followers gate on the announced version, verify the signature and then
//! run one pass over the manifest:
//!
//! ```text
//! Identity -> Actions -> CircleManifests -> Commit
//! ```
//!
//! Actions come before circle manifests so a key delivered in the same
//! manifest opens the content it protects. `Commit` advances the peer's
//! `PeerTopic` and runs only when no retryable failure occurred.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::downloader::Downloader;
use super::events::{IgnoreReason, SyncEvent};
use super::gossip::TopicBroadcaster;
use super::publisher::Publisher;
use super::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, NodeId, StoredAnnouncement};
use crate::wire::{from_json, to_json, Announcement, UserManifest};

/// Steps of a manifest pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStage {
    Identity,
    Actions,
    CircleManifests,
    Commit,
}

/// The order every pass runs its stages in.
pub const PASS_ORDER: [PassStage; 4] = [
    PassStage::Identity,
    PassStage::Actions,
    PassStage::CircleManifests,
    PassStage::Commit,
];

/// Counters from one applied manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestReport {
    pub identity_updated: bool,
    pub actions_fetched: usize,
    pub actions_processed: usize,
    pub circles_synced: usize,
    pub circles_skipped: usize,
    pub posts_added: usize,
    pub reactions_applied: usize,
    pub poisoned: usize,
}

/// Result of [`ManifestProtocol::on_announcement`].
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// Nothing fetched, nothing changed
    Ignored(IgnoreReason),
    /// The pass completed and the peer's version advanced
    Applied {
        version: u64,
        report: ManifestReport,
    },
    /// The pass stopped; the version did not advance
    Failed(SyncError),
}

impl ProcessingOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProcessingOutcome::Applied { .. })
    }
}

pub struct ManifestProtocol {
    ctx: SyncContext,
    publisher: Publisher,
    downloader: Downloader,
    /// Serializes gate-check-then-advance per peer
    peer_locks: parking_lot::Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ManifestProtocol {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            publisher: Publisher::new(ctx.clone()),
            downloader: Downloader::new(ctx.clone()),
            ctx,
            peer_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    fn peer_lock(&self, peer: &NodeId) -> Arc<tokio::sync::Mutex<()>> {
        self.peer_locks.lock().entry(*peer).or_default().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Publishing side
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish pending content and assemble the next manifest.
    ///
    /// Circle manifests are reused while their content is unchanged. Actions
    /// stay listed for the configured retention window after they were first
    /// published; the current key for each member stays listed until it is
    /// superseded or revoked.
    pub async fn build_manifest(&self) -> SyncResult<UserManifest> {
        // Expire before publishing so fresh actions ride at least one manifest
        let retention = self.ctx.config.action_retention().as_millis() as u64;
        let expired = self
            .ctx
            .storage
            .mark_actions_synced(now_millis().saturating_sub(retention))?;
        if expired > 0 {
            debug!(expired, "Actions left the manifest after their retention window");
        }

        let pending = self.publisher.publish_pending().await?;
        let identity = self.ctx.local_identity()?;
        let identity_hash = match identity.self_blob_hash.clone() {
            Some(hash) if self.ctx.blobs.has(&hash).await? => hash,
            _ => self.publisher.publish_identity(&identity).await?,
        };

        let mut circle_manifests = BTreeMap::new();
        for circle in self.ctx.storage.list_circles()? {
            let reusable = match &circle.manifest_blob_hash {
                Some(hash) if !pending.dirty_circles.contains(&circle.id) => {
                    self.ctx.blobs.has(hash).await?
                }
                _ => false,
            };
            let hash = if reusable {
                circle.manifest_blob_hash.clone()
            } else {
                match self.publisher.publish_circle_manifest(&circle).await {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        warn!(circle = circle.id, error = %e, "Leaving circle out of manifest");
                        None
                    }
                }
            };
            if let Some(hash) = hash {
                circle_manifests.insert(circle.id, hash);
            }
        }

        let mut actions: BTreeMap<NodeId, Vec<_>> = BTreeMap::new();
        for action in self.ctx.storage.list_manifest_actions()? {
            if let Some(hash) = action.blob_hash {
                actions.entry(action.recipient).or_default().push(hash);
            }
        }

        let version = self.ctx.storage.load_sync_state()?.version + 1;
        debug!(
            version,
            circles = circle_manifests.len(),
            recipients = actions.len(),
            "Built manifest"
        );
        Ok(UserManifest {
            version,
            identity_hash,
            circle_manifests,
            actions,
        })
    }

    /// Store the manifest, sign an announcement for it and persist the new
    /// version. Broadcasting is left to the caller.
    pub async fn sign_announcement(&self, manifest: &UserManifest) -> SyncResult<Announcement> {
        let mut state = self.ctx.storage.load_sync_state()?;
        if manifest.version <= state.version {
            return Err(SyncError::InvalidOperation(format!(
                "manifest version {} is not newer than {}",
                manifest.version, state.version
            )));
        }

        let hash = self.ctx.blobs.put(Bytes::from(to_json(manifest)?)).await?;
        let announcement = Announcement::sign(hash.clone(), manifest.version, &self.ctx.keypair);

        state.version = manifest.version;
        state.last_manifest_hash = Some(hash.clone());
        state.last_published_at = Some(now_millis());
        state.last_announcement = Some(StoredAnnouncement {
            manifest_hash: hash.clone(),
            version: manifest.version,
            signature: announcement.signature.clone(),
        });
        self.ctx.storage.save_sync_state(&state)?;

        info!(version = manifest.version, %hash, "Signed announcement");
        self.ctx.events.emit(SyncEvent::AnnouncementPublished {
            version: manifest.version,
            manifest_hash: hash,
        });
        Ok(announcement)
    }

    /// Sign `manifest` and broadcast the announcement on our own topic.
    ///
    /// The new version is persisted before broadcasting; a failed broadcast
    /// is logged and repaired by the next re-broadcast.
    pub async fn sign_and_broadcast(
        &self,
        manifest: &UserManifest,
        own_topic: Option<&dyn TopicBroadcaster>,
    ) -> SyncResult<Announcement> {
        let announcement = self.sign_announcement(manifest).await?;
        match own_topic {
            Some(sender) => {
                if let Err(e) = sender.broadcast(Bytes::from(to_json(&announcement)?)).await {
                    warn!(version = announcement.version, error = %e, "Failed to broadcast announcement");
                }
            }
            None => debug!(version = announcement.version, "Not subscribed to own topic, broadcast skipped"),
        }
        Ok(announcement)
    }

    /// The most recently signed announcement, for re-broadcast.
    pub fn current_announcement(&self) -> SyncResult<Option<Announcement>> {
        Ok(self
            .ctx
            .storage
            .load_sync_state()?
            .last_announcement
            .map(|a| Announcement {
                manifest_hash: a.manifest_hash,
                version: a.version,
                signature: a.signature,
            }))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving side
    // ═══════════════════════════════════════════════════════════════════════

    /// Process an announcement broadcast on `peer`'s topic.
    pub async fn on_announcement(
        &self,
        peer: &NodeId,
        announcement: &Announcement,
    ) -> ProcessingOutcome {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        let outcome = self.process(peer, announcement).await;
        match &outcome {
            ProcessingOutcome::Ignored(reason) => {
                debug!(peer = %peer.short(), version = announcement.version, %reason, "Ignoring announcement");
                self.ctx.events.emit(SyncEvent::AnnouncementIgnored {
                    peer: *peer,
                    version: announcement.version,
                    reason: *reason,
                });
            }
            ProcessingOutcome::Applied { version, report } => {
                info!(peer = %peer.short(), version, ?report, "Applied manifest");
                self.ctx.events.emit(SyncEvent::ManifestApplied {
                    peer: *peer,
                    version: *version,
                    posts_added: report.posts_added,
                    reactions_applied: report.reactions_applied,
                    actions_processed: report.actions_processed,
                });
            }
            ProcessingOutcome::Failed(error) => {
                warn!(peer = %peer.short(), version = announcement.version, error = %error, "Manifest not applied");
                self.ctx.events.emit(SyncEvent::ManifestFailed {
                    peer: *peer,
                    version: announcement.version,
                    error: error.to_string(),
                });
            }
        }
        outcome
    }

    async fn process(&self, peer: &NodeId, announcement: &Announcement) -> ProcessingOutcome {
        let topic = match self.ctx.storage.load_peer_topic(peer) {
            Ok(Some(topic)) => topic,
            Ok(None) => return ProcessingOutcome::Ignored(IgnoreReason::UnknownPeer),
            Err(e) => return ProcessingOutcome::Failed(e),
        };
        if !topic.accepts_version(announcement.version) {
            return ProcessingOutcome::Ignored(IgnoreReason::Stale);
        }

        let publisher_key = NodeId::from_bytes(topic.ed25519_public_key);
        if let Err(e) = announcement.verify(&publisher_key) {
            return ProcessingOutcome::Failed(e);
        }

        info!(peer = %peer.short(), version = announcement.version, "Downloading manifest");
        match self.run_pass(peer, announcement).await {
            Ok(report) => ProcessingOutcome::Applied {
                version: announcement.version,
                report,
            },
            Err(e) => ProcessingOutcome::Failed(e),
        }
    }

    async fn run_pass(
        &self,
        peer: &NodeId,
        announcement: &Announcement,
    ) -> SyncResult<ManifestReport> {
        let bytes = self.ctx.fetch(&announcement.manifest_hash, peer).await?;
        let manifest: UserManifest = from_json(&bytes)?;
        if manifest.version != announcement.version {
            return Err(SyncError::ParseFailure(format!(
                "manifest says version {}, announcement says {}",
                manifest.version, announcement.version
            )));
        }

        let mut report = ManifestReport::default();
        let mut blocking: Option<SyncError> = None;

        for stage in PASS_ORDER {
            debug!(peer = %peer.short(), ?stage, "Manifest pass stage");
            match stage {
                PassStage::Identity => {
                    match self
                        .downloader
                        .download_identity(&manifest.identity_hash, peer)
                        .await
                    {
                        Ok(updated) => report.identity_updated = updated,
                        Err(e) => {
                            warn!(peer = %peer.short(), error = %e, "Identity not applied");
                            defer(e, &mut blocking, &mut report);
                        }
                    }
                }
                PassStage::Actions => {
                    let me = self.ctx.node_id();
                    for hash in manifest.actions.get(&me).into_iter().flatten() {
                        match self.downloader.download_action(hash, peer).await {
                            Ok(true) => report.actions_fetched += 1,
                            Ok(false) => {}
                            Err(e) => {
                                warn!(peer = %peer.short(), action = %hash, error = %e, "Action not fetched");
                                defer(e, &mut blocking, &mut report);
                            }
                        }
                    }
                    report.actions_processed = self.downloader.process_actions().await?.processed;
                }
                PassStage::CircleManifests => {
                    for (circle, hash) in &manifest.circle_manifests {
                        match self
                            .downloader
                            .download_circle_manifest(peer, *circle, hash)
                            .await
                        {
                            Ok(circle_report) => {
                                if circle_report.skipped {
                                    report.circles_skipped += 1;
                                } else {
                                    report.circles_synced += 1;
                                }
                                report.posts_added += circle_report.posts_added;
                                report.reactions_applied += circle_report.reactions_applied;
                                report.poisoned += circle_report.poisoned;
                                if let Some(e) = circle_report.blocking_error {
                                    defer(e, &mut blocking, &mut report);
                                }
                            }
                            Err(e) => {
                                warn!(peer = %peer.short(), circle, error = %e, "Circle manifest not applied");
                                defer(e, &mut blocking, &mut report);
                            }
                        }
                    }
                }
                PassStage::Commit => {
                    if let Some(e) = blocking.take() {
                        return Err(e);
                    }
                    self.ctx.storage.advance_peer_sync(
                        peer,
                        announcement.version,
                        &announcement.manifest_hash,
                        now_millis(),
                    )?;
                }
            }
        }
        Ok(report)
    }
}

/// Retryable errors hold back the version advance; the first one is kept.
fn defer(error: SyncError, blocking: &mut Option<SyncError>, report: &mut ManifestReport) {
    if error.is_retryable() {
        blocking.get_or_insert(error);
    } else {
        report.poisoned += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeypair;
    use crate::sync::test_support::{onboard, temp_context};
    use crate::types::{PeerTopic, TopicKey};

    #[test]
    fn test_actions_run_before_circle_manifests() {
        let position = |stage| PASS_ORDER.iter().position(|s| *s == stage).unwrap();
        assert!(position(PassStage::Actions) < position(PassStage::CircleManifests));
        assert_eq!(PASS_ORDER.last(), Some(&PassStage::Commit));
    }

    #[tokio::test]
    async fn test_versions_increase() {
        let (ctx, _blobs, _dir) = temp_context();
        onboard(&ctx);
        let protocol = ManifestProtocol::new(ctx.clone());

        let first = protocol.build_manifest().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.circle_manifests.len(), 1);
        let ann = protocol.sign_announcement(&first).await.unwrap();
        assert!(ann.verify(&ctx.node_id()).is_ok());

        // Replaying an old manifest is refused
        assert!(protocol.sign_announcement(&first).await.is_err());

        let second = protocol.build_manifest().await.unwrap();
        assert_eq!(second.version, 2);
        // Unchanged circle manifests are reused
        assert_eq!(second.circle_manifests, first.circle_manifests);
        assert_eq!(second.identity_hash, first.identity_hash);

        protocol.sign_announcement(&second).await.unwrap();
        assert_eq!(
            protocol.current_announcement().unwrap().unwrap().version,
            2
        );
    }

    #[tokio::test]
    async fn test_build_manifest_requires_identity() {
        let (ctx, _blobs, _dir) = temp_context();
        let protocol = ManifestProtocol::new(ctx);
        assert!(matches!(
            protocol.build_manifest().await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_ignored() {
        let (ctx, _blobs, _dir) = temp_context();
        let protocol = ManifestProtocol::new(ctx);
        let peer = NodeKeypair::generate();
        let ann = Announcement::sign(crate::types::BlobHash::of(b"m"), 1, &peer);

        let outcome = protocol.on_announcement(&peer.node_id(), &ann).await;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Ignored(IgnoreReason::UnknownPeer)
        ));
    }

    #[tokio::test]
    async fn test_bad_signature_fails_without_advancing() {
        let (ctx, _blobs, _dir) = temp_context();
        let protocol = ManifestProtocol::new(ctx.clone());
        let peer = NodeKeypair::generate();
        let impostor = NodeKeypair::generate();
        ctx.storage
            .save_peer_topic(&PeerTopic::new(
                peer.node_id(),
                TopicKey::for_node(&peer.node_id()),
            ))
            .unwrap();

        let forged = Announcement::sign(crate::types::BlobHash::of(b"m"), 1, &impostor);
        let outcome = protocol.on_announcement(&peer.node_id(), &forged).await;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failed(SyncError::SignatureInvalid(_))
        ));
        let topic = ctx.storage.load_peer_topic(&peer.node_id()).unwrap().unwrap();
        assert_eq!(topic.last_known_version, None);
    }

    #[tokio::test]
    async fn test_missing_manifest_blob_does_not_advance() {
        let (ctx, _blobs, _dir) = temp_context();
        let protocol = ManifestProtocol::new(ctx.clone());
        let peer = NodeKeypair::generate();
        ctx.storage
            .save_peer_topic(&PeerTopic::new(
                peer.node_id(),
                TopicKey::for_node(&peer.node_id()),
            ))
            .unwrap();

        let ann = Announcement::sign(crate::types::BlobHash::of(b"nowhere"), 1, &peer);
        let outcome = protocol.on_announcement(&peer.node_id(), &ann).await;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failed(SyncError::TransportFailure(_))
        ));
        let topic = ctx.storage.load_peer_topic(&peer.node_id()).unwrap().unwrap();
        assert!(topic.accepts_version(1));
    }

    #[tokio::test]
    async fn test_dirty_circle_gets_new_manifest() {
        let (ctx, _blobs, _dir) = temp_context();
        onboard(&ctx);
        let protocol = ManifestProtocol::new(ctx.clone());
        let first = protocol.build_manifest().await.unwrap();
        protocol.sign_announcement(&first).await.unwrap();

        let me = ctx.local_identity().unwrap();
        let circle = ctx.storage.everyone_circle().unwrap().unwrap();
        ctx.storage
            .insert_post(&crate::types::Post {
                id: 0,
                author_identity_id: me.id,
                blob_hash: None,
                timestamp: 1,
                parent_hash: None,
                text: "new".to_string(),
                signature: String::new(),
                files: Vec::new(),
                circle_id: Some(circle.id),
            })
            .unwrap();

        let second = protocol.build_manifest().await.unwrap();
        assert_ne!(
            second.circle_manifests.get(&circle.id),
            first.circle_manifests.get(&circle.id)
        );
    }
}
