//! CircleSync Core Library
//!
//! Encrypted circle sharing over gossip announcements and content-addressed
//! blobs.
//!
//! ## Overview
//!
//! Every node publishes what it shares as a signed, versioned manifest.
//! Content lives in blobs sealed with per-circle keys; circle keys travel to
//! members as actions wrapped with an X25519 agreement between the two
//! nodes' identity keys. Followers subscribe to the gossip topics of the
//! peers they were introduced to and apply each new manifest exactly once.
//!
//! ## Core Principles
//!
//! - **Local-first**: edits land in redb and are sealed on the next publish
//! - **Content-addressed**: every object is known by the hash of its bytes
//! - **Version-gated**: a peer's progress advances only after a complete pass
//!
//! ## Quick Start
//!
//! ```ignore
//! use circlesync_core::{CircleSyncEngine, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = CircleSyncEngine::open_with_iroh(SyncConfig::default()).await?;
//!     engine.onboard("alice")?;
//!
//!     let everyone = engine.list_circles()?.remove(0);
//!     engine.create_post(everyone.id, "Hello circle", None, vec![]).await?;
//!
//!     engine.start().await?;
//!     let announcement = engine.publish().await?;
//!     println!("published version {}", announcement.version);
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod keys;
pub mod logging;
pub mod storage;
pub mod sync;
pub mod types;
pub mod wire;

// Re-exports
pub use blobs::{BlobStore, IrohBlobStore, MemoryBlobNetwork, MemoryBlobStore};
pub use config::SyncConfig;
pub use crypto::{CircleCrypto, MultiCipher};
pub use engine::{CircleSyncEngine, NodeInfo};
pub use error::{SyncError, SyncResult};
pub use identity::NodeKeypair;
pub use keys::{KeyHandle, KeyRing, KeySubject};
pub use storage::Storage;
pub use sync::{
    GossipTransport, IgnoreReason, IrohGossip, ManifestReport, MemoryGossip, MemoryGossipHub,
    ProcessingOutcome, SyncEvent,
};
pub use types::*;
pub use wire::{Announcement, CircleManifest, UserManifest};
