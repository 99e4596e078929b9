//! Content downloader
//!
//! Fetches, decrypts and ingests objects a peer published. Every object is
//! keyed by its blob hash, so re-ingesting a known hash is a no-op. Each
//! `download_*` returns `Ok(true)` when it changed local state.

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::events::SyncEvent;
use super::SyncContext;
use crate::crypto::MultiCipher;
use crate::error::{SyncError, SyncResult};
use crate::keys::unwrap_key_from_peer;
use crate::types::{
    now_millis, ActionKind, BlobHash, CircleId, FileRef, InboundAction, NodeId, Post, Reaction,
};
use crate::wire::{from_json, ActionWire, CircleManifest, IdentityWire, PostWire, ReactionWire};

/// Outcome of one circle manifest.
#[derive(Debug, Default)]
pub struct CircleReport {
    pub circle: CircleId,
    /// No key for the circle; nothing fetched
    pub skipped: bool,
    pub posts_added: usize,
    pub reactions_applied: usize,
    /// Objects dropped for good (bad JSON, wrong author)
    pub poisoned: usize,
    /// First failure that must be retried on a later announcement
    pub blocking_error: Option<SyncError>,
}

impl CircleReport {
    fn record(&mut self, what: &str, hash: &BlobHash, error: SyncError) {
        if error.is_retryable() {
            warn!(circle = self.circle, %hash, error = %error, "Failed to download {}", what);
            if self.blocking_error.is_none() {
                self.blocking_error = Some(error);
            }
        } else {
            warn!(circle = self.circle, %hash, error = %error, "Dropping {}", what);
            self.poisoned += 1;
        }
    }
}

/// Outcome of [`Downloader::process_actions`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Downloader {
    ctx: SyncContext,
}

impl Downloader {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    /// Ingest the identity `peer` published under `hash`.
    pub async fn download_identity(&self, hash: &BlobHash, peer: &NodeId) -> SyncResult<bool> {
        if let Some(existing) = self.ctx.storage.find_identity_by_owner(peer)? {
            if existing.self_blob_hash.as_ref() == Some(hash) {
                return Ok(false);
            }
        }

        let bytes = self.ctx.fetch(hash, peer).await?;
        let wire: IdentityWire = from_json(&bytes)?;

        let mut identity = self.ctx.storage.ensure_identity(peer)?;
        identity.display_name = wire.name;
        identity.avatar_blob_hash = wire.profile_pic_hash;
        identity.self_blob_hash = Some(hash.clone());
        self.ctx.storage.update_identity(&identity)?;
        info!(peer = %peer.short(), name = %identity.display_name, "Updated peer identity");

        if let Some(avatar) = &identity.avatar_blob_hash {
            if !self.ctx.blobs.has(avatar).await? {
                if let Err(e) = self.ctx.fetch(avatar, peer).await {
                    debug!(peer = %peer.short(), %avatar, error = %e, "Avatar not fetched");
                }
            }
        }
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts and reactions
    // ═══════════════════════════════════════════════════════════════════════

    /// Ingest a post `peer` published into their circle `circle`.
    ///
    /// Unknown authors get a placeholder identity. Attachments are fetched
    /// after the post is stored; their failures are logged and retried by
    /// [`Downloader::retry_missing_files`].
    pub async fn download_post(
        &self,
        hash: &BlobHash,
        peer: &NodeId,
        cipher: &MultiCipher,
        circle: CircleId,
    ) -> SyncResult<bool> {
        if self.ctx.storage.find_post_by_hash(hash)?.is_some() {
            return Ok(false);
        }

        let bytes = self.ctx.fetch(hash, peer).await?;
        let wire: PostWire = cipher.decrypt_json(&bytes)?;
        wire.verify(peer)?;

        let author = self.ctx.storage.ensure_identity(peer)?;

        // Same signed fields under a new key: the author re-sealed the post
        // after a rotation, so move the row to the new hash.
        let republished = self
            .ctx
            .storage
            .list_posts_by_author(author.id)?
            .into_iter()
            .find(|p| p.signature == wire.signature);
        if let Some(mut existing) = republished {
            let files = wire
                .files
                .into_iter()
                .enumerate()
                .map(|(i, f)| {
                    let mut file = FileRef::remote(f.mime_type, f.blob_hash);
                    file.local_hash = existing
                        .files
                        .get(i)
                        .filter(|old| old.mime_type == file.mime_type)
                        .and_then(|old| old.local_hash.clone());
                    file
                })
                .collect();
            existing.files = files;
            existing.blob_hash = Some(hash.clone());
            existing.circle_id = Some(circle);
            self.ctx.storage.update_post(&existing)?;
            debug!(peer = %peer.short(), circle, %hash, post = existing.id, "Rebound republished post");
            return Ok(false);
        }

        let post = self.ctx.storage.insert_post(&Post {
            id: 0,
            author_identity_id: author.id,
            blob_hash: Some(hash.clone()),
            timestamp: wire.timestamp,
            parent_hash: wire.parent_hash,
            text: wire.text,
            signature: wire.signature,
            files: wire
                .files
                .into_iter()
                .map(|f| FileRef::remote(f.mime_type, f.blob_hash))
                .collect(),
            circle_id: Some(circle),
        })?;
        debug!(peer = %peer.short(), circle, %hash, "Stored post");

        if !post.files.is_empty() {
            self.fetch_missing_files(post, peer, circle).await?;
        }
        Ok(true)
    }

    /// Fetch and decrypt the files of `post` that have no local copy.
    /// Returns how many were recovered.
    async fn fetch_missing_files(
        &self,
        mut post: Post,
        peer: &NodeId,
        circle: CircleId,
    ) -> SyncResult<usize> {
        let cipher = self.ctx.keys.file_decryptor_for(peer, circle)?;
        let mut recovered = 0;
        for file in post.files.iter_mut() {
            if file.local_hash.is_some() {
                continue;
            }
            let Some(blob_hash) = file.blob_hash.clone() else {
                continue;
            };
            let plaintext = match self.ctx.fetch(&blob_hash, peer).await {
                Ok(sealed) => cipher.decrypt_binary(&sealed),
                Err(e) => Err(e),
            };
            match plaintext {
                Ok(plaintext) => {
                    file.local_hash = Some(self.ctx.blobs.put(Bytes::from(plaintext)).await?);
                    recovered += 1;
                }
                Err(e) => {
                    warn!(post = post.id, file = %blob_hash, error = %e, "Failed to fetch attachment")
                }
            }
        }
        if recovered > 0 {
            self.ctx.storage.update_post(&post)?;
        }
        Ok(recovered)
    }

    /// Ingest a reaction or tombstone `peer` published.
    ///
    /// Reactions are last-writer-wins by timestamp per
    /// `(post_hash, author, emoji)`.
    pub async fn download_reaction(
        &self,
        hash: &BlobHash,
        peer: &NodeId,
        cipher: &MultiCipher,
        circle: CircleId,
    ) -> SyncResult<bool> {
        if self.ctx.storage.is_reaction_blob_seen(hash)? {
            return Ok(false);
        }

        let bytes = self.ctx.fetch(hash, peer).await?;
        let wire: ReactionWire = cipher.decrypt_json(&bytes)?;
        if wire.author_node_id != *peer {
            return Err(SyncError::ParseFailure(format!(
                "reaction {} is by {}, not its publisher {}",
                hash,
                wire.author_node_id.short(),
                peer.short()
            )));
        }
        wire.verify()?;

        let existing = self
            .ctx
            .storage
            .find_reaction(&wire.post_hash, &wire.author_node_id, &wire.emoji)?;
        let newer = existing
            .as_ref()
            .map_or(true, |r| r.timestamp <= wire.timestamp);

        if newer {
            if wire.is_removal {
                self.ctx
                    .storage
                    .delete_reaction(&wire.post_hash, &wire.author_node_id, &wire.emoji)?;
            } else {
                self.ctx.storage.upsert_reaction(&Reaction {
                    id: 0,
                    post_hash: wire.post_hash,
                    author_node_id: wire.author_node_id,
                    emoji: wire.emoji,
                    timestamp: wire.timestamp,
                    signature: wire.signature,
                    blob_hash: Some(hash.clone()),
                    circle_id: Some(circle),
                    removed: false,
                })?;
            }
        }
        self.ctx.storage.mark_reaction_blob_seen(hash)?;
        Ok(newer)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Circle manifests
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch one of `peer`'s circle manifests and everything it lists.
    ///
    /// Circles we hold no key for are skipped without fetching. A manifest
    /// none of our keys opens is skipped too: the Actions stage has already
    /// delivered every key the publisher still sends us.
    pub async fn download_circle_manifest(
        &self,
        peer: &NodeId,
        circle: CircleId,
        hash: &BlobHash,
    ) -> SyncResult<CircleReport> {
        let mut report = CircleReport {
            circle,
            ..Default::default()
        };
        let cipher = self.ctx.keys.decryptor_for(peer, circle)?;
        if !cipher.has_keys() {
            debug!(peer = %peer.short(), circle, "No key for circle, skipping");
            report.skipped = true;
            return Ok(report);
        }

        let bytes = self.ctx.fetch(hash, peer).await?;
        let manifest: CircleManifest = match cipher.decrypt_json(&bytes) {
            Ok(manifest) => manifest,
            Err(SyncError::DecryptFailure(reason)) => {
                debug!(peer = %peer.short(), circle, %reason, "No held key opens circle manifest, skipping");
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        debug!(
            peer = %peer.short(),
            circle,
            name = %manifest.name,
            posts = manifest.posts.len(),
            reactions = manifest.reactions.len(),
            "Processing circle manifest"
        );

        for entry in &manifest.posts {
            if entry.author_node_id != *peer {
                debug!(circle, post = %entry.hash, "Skipping post not authored by publisher");
                continue;
            }
            match self.download_post(&entry.hash, peer, &cipher, circle).await {
                Ok(true) => report.posts_added += 1,
                Ok(false) => {}
                Err(e) => report.record("post", &entry.hash, e),
            }
        }

        for reaction in &manifest.reactions {
            match self.download_reaction(reaction, peer, &cipher, circle).await {
                Ok(true) => report.reactions_applied += 1,
                Ok(false) => {}
                Err(e) => report.record("reaction", reaction, e),
            }
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Actions
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch an action `peer` addressed to us and queue it for processing.
    pub async fn download_action(&self, hash: &BlobHash, peer: &NodeId) -> SyncResult<bool> {
        if self.ctx.storage.load_inbound_action(hash)?.is_some() {
            return Ok(false);
        }
        let bytes = self.ctx.fetch(hash, peer).await?;
        let wire: ActionWire = from_json(&bytes)?;
        self.ctx.storage.insert_inbound_action(&InboundAction {
            blob_hash: hash.clone(),
            sender: *peer,
            kind: wire.kind,
            data: wire.data,
            timestamp: wire.timestamp,
            circle_id: wire.circle_id,
            processed: false,
        })
    }

    /// Apply every unprocessed inbound action, oldest first.
    ///
    /// Each action is marked processed exactly once, whether or not it
    /// applied; one failure never stops the batch.
    pub async fn process_actions(&self) -> SyncResult<ActionReport> {
        let mut report = ActionReport::default();
        for action in self.ctx.storage.list_unprocessed_actions()? {
            match self.apply_action(&action).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(
                        kind = %action.kind,
                        sender = %action.sender.short(),
                        action = %action.blob_hash,
                        error = %e,
                        "Failed to apply action"
                    );
                    report.failed += 1;
                }
            }
            self.ctx.storage.mark_action_processed(&action.blob_hash)?;
        }
        Ok(report)
    }

    async fn apply_action(&self, action: &InboundAction) -> SyncResult<()> {
        match action.kind {
            ActionKind::UpdateKey => {
                let unwrapped =
                    unwrap_key_from_peer(&action.data, &self.ctx.keypair, &action.sender)?;
                self.ctx.keys.store_secret_key_for_peer(
                    &action.sender,
                    action.circle_id,
                    &unwrapped.key,
                )?;
                info!(
                    sender = %action.sender.short(),
                    circle = ?action.circle_id,
                    source = ?unwrapped.source,
                    "Stored circle key from peer"
                );
                self.ctx.events.emit(SyncEvent::KeyReceived {
                    peer: action.sender,
                    circle: action.circle_id,
                });
                Ok(())
            }
            ActionKind::Delete => {
                let hash = BlobHash::parse(&action.data)?;
                let Some(post) = self.ctx.storage.find_post_by_hash(&hash)? else {
                    debug!(post = %hash, "Delete for unknown post");
                    return Ok(());
                };
                let author = self.ctx.storage.load_identity(post.author_identity_id)?;
                if author.map(|a| a.owner_node_id) != Some(action.sender) {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} cannot delete post {} it did not author",
                        action.sender.short(),
                        hash
                    )));
                }
                for file in &post.files {
                    for cached in [&file.blob_hash, &file.local_hash].into_iter().flatten() {
                        self.ctx.blobs.delete(cached).await?;
                    }
                }
                self.ctx.storage.delete_post(post.id)?;
                self.ctx.blobs.delete(&hash).await?;
                info!(post = %hash, sender = %action.sender.short(), "Deleted post");
                Ok(())
            }
            ActionKind::Introduce => {
                info!(sender = %action.sender.short(), "Ignoring Introduce action");
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Retry attachments of recent remote posts that have no local copy,
    /// using the author's current key candidates.
    pub async fn retry_missing_files(&self) -> SyncResult<usize> {
        let window = self.ctx.config.missing_file_window().as_millis() as u64;
        let since = now_millis().saturating_sub(window);
        let me = self.ctx.node_id();

        let mut recovered = 0;
        for post in self.ctx.storage.list_posts_since(since)? {
            if post.files.iter().all(|f| f.local_hash.is_some()) {
                continue;
            }
            let Some(circle) = post.circle_id else {
                continue;
            };
            let Some(author) = self.ctx.storage.load_identity(post.author_identity_id)? else {
                continue;
            };
            if author.owner_node_id == me {
                continue;
            }
            recovered += self
                .fetch_missing_files(post, &author.owner_node_id, circle)
                .await?;
        }
        if recovered > 0 {
            info!(recovered, "Recovered missing attachments");
        }
        Ok(recovered)
    }
}
