//! Content publisher
//!
//! Turns local rows into blobs. Identity and action blobs are plaintext
//! JSON; posts, reactions, files and circle manifests are sealed with the
//! circle key. A row's hash is written back only after its blob is stored,
//! so a failed publish is retried by the next one.

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::SyncContext;
use crate::crypto::CircleCrypto;
use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, BlobHash, Circle, CircleId, Identity, Post, Reaction};
use crate::wire::{
    to_json, ActionWire, CircleManifest, FileWire, IdentityWire, PostEntry, PostWire,
    ReactionWire,
};

/// What [`Publisher::publish_pending`] stored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub identity: bool,
    pub posts: usize,
    pub reactions: usize,
    pub actions: usize,
    /// Circles whose manifest must be rebuilt
    pub dirty_circles: BTreeSet<CircleId>,
}

#[derive(Clone)]
pub struct Publisher {
    ctx: SyncContext,
}

impl Publisher {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    async fn put(&self, data: Vec<u8>) -> SyncResult<BlobHash> {
        self.ctx.blobs.put(Bytes::from(data)).await
    }

    /// Store the identity as public JSON and record its hash.
    pub async fn publish_identity(&self, identity: &Identity) -> SyncResult<BlobHash> {
        let wire = IdentityWire {
            name: identity.display_name.clone(),
            profile_pic_hash: identity.avatar_blob_hash.clone(),
        };
        let hash = self.put(to_json(&wire)?).await?;

        if identity.self_blob_hash.as_ref() != Some(&hash) {
            let mut updated = identity.clone();
            updated.self_blob_hash = Some(hash.clone());
            self.ctx.storage.update_identity(&updated)?;
        }
        info!(%hash, name = %identity.display_name, "Published identity");
        Ok(hash)
    }

    /// Seal and store a local post and its attachments under `cipher`.
    ///
    /// Attachments are read from their plaintext local blobs and sealed with
    /// the same cipher as the body.
    pub async fn publish_post(
        &self,
        post: &Post,
        circle: CircleId,
        cipher: &CircleCrypto,
    ) -> SyncResult<BlobHash> {
        let mut files = post.files.clone();
        let mut file_wires = Vec::with_capacity(files.len());
        for file in files.iter_mut() {
            let local = file.local_hash.as_ref().ok_or_else(|| {
                SyncError::InvalidOperation(format!("post {} has a file with no content", post.id))
            })?;
            let plaintext = self
                .ctx
                .blobs
                .get(local, None)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("file blob {}", local)))?;
            let sealed = cipher.encrypt(&plaintext)?;
            let blob_hash = self.put(sealed).await?;
            file_wires.push(FileWire {
                mime_type: file.mime_type.clone(),
                blob_hash: blob_hash.clone(),
            });
            file.blob_hash = Some(blob_hash);
        }

        let signature = PostWire::sign_fields(
            post.timestamp,
            post.parent_hash.as_ref(),
            &post.text,
            &self.ctx.keypair,
        );
        let wire = PostWire {
            timestamp: post.timestamp,
            parent_hash: post.parent_hash.clone(),
            text: post.text.clone(),
            files: file_wires,
            signature: signature.clone(),
        };
        let hash = self.put(cipher.encrypt(&to_json(&wire)?)?).await?;

        let mut updated = post.clone();
        updated.blob_hash = Some(hash.clone());
        updated.signature = signature;
        updated.files = files;
        updated.circle_id = Some(circle);
        self.ctx.storage.update_post(&updated)?;

        debug!(post = post.id, circle, %hash, files = updated.files.len(), "Published post");
        Ok(hash)
    }

    /// Seal and store a reaction. A removal is published as a tombstone.
    pub async fn publish_reaction(
        &self,
        reaction: &Reaction,
        cipher: &CircleCrypto,
        is_removal: bool,
    ) -> SyncResult<BlobHash> {
        let wire = ReactionWire::signed(
            reaction.post_hash.clone(),
            reaction.emoji.clone(),
            reaction.timestamp,
            is_removal,
            &self.ctx.keypair,
        );
        let hash = self.put(cipher.encrypt(&to_json(&wire)?)?).await?;

        let mut updated = reaction.clone();
        updated.blob_hash = Some(hash.clone());
        updated.signature = wire.signature;
        updated.removed = is_removal;
        self.ctx.storage.update_reaction(&updated)?;

        debug!(post = %reaction.post_hash, emoji = %reaction.emoji, is_removal, %hash, "Published reaction");
        Ok(hash)
    }

    /// Store every queued action as its own plaintext blob.
    ///
    /// Returns how many were stored; failures stay queued.
    pub async fn publish_actions(&self) -> SyncResult<usize> {
        let mut published = 0;
        for mut action in self.ctx.storage.list_unpublished_actions()? {
            let wire = ActionWire {
                kind: action.kind,
                data: action.data.clone(),
                timestamp: action.timestamp,
                circle_id: action.circle_id,
            };
            match self.put(to_json(&wire)?).await {
                Ok(hash) => {
                    debug!(kind = %action.kind, recipient = %action.recipient.short(), %hash, "Published action");
                    action.blob_hash = Some(hash);
                    action.published_at = Some(now_millis());
                    self.ctx.storage.update_outbound_action(&action)?;
                    published += 1;
                }
                Err(e) => warn!(action = action.id, error = %e, "Failed to publish action"),
            }
        }
        Ok(published)
    }

    /// Build, seal and store the manifest of one local circle.
    ///
    /// Lists this node's published posts in the circle, its reaction blobs
    /// (tombstones included) and the members' node ids.
    pub async fn publish_circle_manifest(&self, circle: &Circle) -> SyncResult<BlobHash> {
        let me = self.ctx.local_identity()?;
        let node = self.ctx.node_id();
        let cipher = self.ctx.keys.circle_crypto(circle.id)?;

        let mut posts: Vec<PostEntry> = self
            .ctx
            .storage
            .list_posts_in_circle(me.id, circle.id)?
            .into_iter()
            .filter_map(|p| {
                p.blob_hash.map(|hash| PostEntry {
                    hash,
                    timestamp: p.timestamp,
                    author_node_id: node,
                })
            })
            .collect();
        posts.sort_by_key(|p| p.timestamp);

        let mut members = Vec::new();
        for identity_id in self.ctx.storage.list_circle_members(circle.id)? {
            if let Some(identity) = self.ctx.storage.load_identity(identity_id)? {
                members.push(identity.owner_node_id);
            }
        }

        let reactions = self
            .ctx
            .storage
            .list_reactions_by_author(&node)?
            .into_iter()
            .filter(|r| r.circle_id == Some(circle.id))
            .filter_map(|r| r.blob_hash)
            .collect();

        let manifest = CircleManifest {
            name: circle.name.clone(),
            posts,
            members,
            reactions,
        };
        let hash = self.put(cipher.encrypt(&to_json(&manifest)?)?).await?;

        let mut updated = circle.clone();
        updated.manifest_blob_hash = Some(hash.clone());
        self.ctx.storage.update_circle(&updated)?;

        info!(
            circle = circle.id,
            name = %circle.name,
            posts = manifest.posts.len(),
            members = manifest.members.len(),
            %hash,
            "Published circle manifest"
        );
        Ok(hash)
    }

    /// Publish everything local that has no blob yet: the identity, own
    /// posts, own reactions and queued actions.
    ///
    /// Individual failures are logged and left for the next call.
    pub async fn publish_pending(&self) -> SyncResult<PublishReport> {
        let mut report = PublishReport::default();
        let me = self.ctx.local_identity()?;

        if me.self_blob_hash.is_none() {
            self.publish_identity(&me).await?;
            report.identity = true;
        }

        for post in self.ctx.storage.list_posts_by_author(me.id)? {
            let Some(circle) = post.circle_id else {
                continue;
            };
            if post.blob_hash.is_some() {
                continue;
            }
            let result = match self.ctx.keys.circle_crypto(circle) {
                Ok(cipher) => self.publish_post(&post, circle, &cipher).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    report.posts += 1;
                    report.dirty_circles.insert(circle);
                }
                Err(e) => warn!(post = post.id, circle, error = %e, "Failed to publish post"),
            }
        }

        for reaction in self.ctx.storage.list_reactions_by_author(&self.ctx.node_id())? {
            let Some(circle) = reaction.circle_id else {
                continue;
            };
            if reaction.blob_hash.is_some() {
                continue;
            }
            let result = match self.ctx.keys.circle_crypto(circle) {
                Ok(cipher) => {
                    self.publish_reaction(&reaction, &cipher, reaction.removed)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    report.reactions += 1;
                    report.dirty_circles.insert(circle);
                }
                Err(e) => warn!(reaction = reaction.id, circle, error = %e, "Failed to publish reaction"),
            }
        }

        report.actions = self.publish_actions().await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobStore;
    use crate::crypto::MultiCipher;
    use crate::sync::test_support::temp_context;
    use crate::types::{ActionKind, FileRef, NodeId, OutboundAction};
    use crate::wire::from_json;

    fn onboard(ctx: &SyncContext) -> (Identity, Circle) {
        let me = ctx
            .storage
            .insert_identity(&Identity::new(ctx.node_id(), "alice"))
            .unwrap();
        let circle = ctx.storage.insert_circle(&Circle::everyone(me.id)).unwrap();
        ctx.keys.generate_circle_key(circle.id).unwrap();
        (me, circle)
    }

    #[tokio::test]
    async fn test_publish_identity_is_plaintext() {
        let (ctx, blobs, _dir) = temp_context();
        let (me, _) = onboard(&ctx);
        let publisher = Publisher::new(ctx.clone());

        let hash = publisher.publish_identity(&me).await.unwrap();
        let bytes = blobs.get(&hash, None).await.unwrap().unwrap();
        let wire: IdentityWire = from_json(&bytes).unwrap();
        assert_eq!(wire.name, "alice");

        let stored = ctx.storage.load_identity(me.id).unwrap().unwrap();
        assert_eq!(stored.self_blob_hash, Some(hash));
    }

    #[tokio::test]
    async fn test_publish_post_seals_body_and_files() {
        let (ctx, blobs, _dir) = temp_context();
        let (me, circle) = onboard(&ctx);
        let publisher = Publisher::new(ctx.clone());

        let file_hash = blobs.put(Bytes::from_static(b"png bytes")).await.unwrap();
        let mut post = Post {
            id: 0,
            author_identity_id: me.id,
            blob_hash: None,
            timestamp: 1_000,
            parent_hash: None,
            text: "hello".to_string(),
            signature: String::new(),
            files: vec![FileRef::local("image/png", file_hash.clone())],
            circle_id: Some(circle.id),
        };
        post = ctx.storage.insert_post(&post).unwrap();

        let cipher = ctx.keys.circle_crypto(circle.id).unwrap();
        let hash = publisher.publish_post(&post, circle.id, &cipher).await.unwrap();

        let sealed = blobs.get(&hash, None).await.unwrap().unwrap();
        assert!(from_json::<PostWire>(&sealed).is_err());
        let wire: PostWire = MultiCipher::new(vec![ctx.keys.circle_crypto(circle.id).unwrap()])
            .decrypt_json(&sealed)
            .unwrap();
        assert_eq!(wire.text, "hello");
        assert!(wire.verify(&ctx.node_id()).is_ok());

        let file_blob = blobs.get(&wire.files[0].blob_hash, None).await.unwrap().unwrap();
        assert_eq!(cipher.decrypt(&file_blob).unwrap(), b"png bytes");

        let stored = ctx.storage.find_post_by_hash(&hash).unwrap().unwrap();
        assert_eq!(stored.files[0].blob_hash, Some(wire.files[0].blob_hash.clone()));
        assert_eq!(stored.files[0].local_hash, Some(file_hash));
    }

    #[tokio::test]
    async fn test_failed_post_publish_leaves_hash_unset() {
        let (ctx, _blobs, _dir) = temp_context();
        let (me, circle) = onboard(&ctx);
        let publisher = Publisher::new(ctx.clone());

        let post = ctx
            .storage
            .insert_post(&Post {
                id: 0,
                author_identity_id: me.id,
                blob_hash: None,
                timestamp: 1,
                parent_hash: None,
                text: "with missing file".to_string(),
                signature: String::new(),
                files: vec![FileRef::local("image/png", BlobHash::of(b"absent"))],
                circle_id: Some(circle.id),
            })
            .unwrap();

        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.posts, 0);
        assert!(ctx.storage.load_post(post.id).unwrap().unwrap().blob_hash.is_none());
    }

    #[tokio::test]
    async fn test_publish_actions_once() {
        let (ctx, blobs, _dir) = temp_context();
        onboard(&ctx);
        let publisher = Publisher::new(ctx.clone());

        let peer = NodeId::from_bytes([5u8; 32]);
        ctx.storage
            .queue_action(&OutboundAction::new(peer, ActionKind::Delete, "abc", None))
            .unwrap();

        assert_eq!(publisher.publish_actions().await.unwrap(), 1);
        assert_eq!(publisher.publish_actions().await.unwrap(), 0);

        let action = &ctx.storage.list_manifest_actions().unwrap()[0];
        let bytes = blobs
            .get(action.blob_hash.as_ref().unwrap(), None)
            .await
            .unwrap()
            .unwrap();
        let wire: ActionWire = from_json(&bytes).unwrap();
        assert_eq!(wire.kind, ActionKind::Delete);
        assert_eq!(wire.data, "abc");
    }

    #[tokio::test]
    async fn test_circle_manifest_lists_own_published_posts_and_members() {
        let (ctx, _blobs, _dir) = temp_context();
        let (me, circle) = onboard(&ctx);
        let publisher = Publisher::new(ctx.clone());

        let friend = ctx
            .storage
            .ensure_identity(&NodeId::from_bytes([7u8; 32]))
            .unwrap();
        ctx.storage.add_circle_member(circle.id, friend.id).unwrap();

        ctx.storage
            .insert_post(&Post {
                id: 0,
                author_identity_id: me.id,
                blob_hash: None,
                timestamp: 5,
                parent_hash: None,
                text: "one".to_string(),
                signature: String::new(),
                files: Vec::new(),
                circle_id: Some(circle.id),
            })
            .unwrap();
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.posts, 1);
        assert!(report.identity);
        assert!(report.dirty_circles.contains(&circle.id));

        let hash = publisher.publish_circle_manifest(&circle).await.unwrap();
        let sealed = ctx.blobs.get(&hash, None).await.unwrap().unwrap();
        let cipher = MultiCipher::new(vec![ctx.keys.circle_crypto(circle.id).unwrap()]);
        let manifest: CircleManifest = cipher.decrypt_json(&sealed).unwrap();

        assert_eq!(manifest.name, "Everyone");
        assert_eq!(manifest.posts.len(), 1);
        assert_eq!(manifest.posts[0].author_node_id, ctx.node_id());
        assert_eq!(manifest.members, vec![NodeId::from_bytes([7u8; 32])]);
        assert_eq!(
            ctx.storage.load_circle(circle.id).unwrap().unwrap().manifest_blob_hash,
            Some(hash)
        );
    }
}
