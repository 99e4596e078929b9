//! CircleSync CLI
//!
//! Thin wrapper around circlesync-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! circlesync info
//!
//! # Create the local identity (and the "everyone" circle)
//! circlesync identity set-name alice
//!
//! # Create a circle and add a peer to it
//! circlesync circle create friends
//! circlesync circle add-member 2 <node_id>
//!
//! # Post into a circle, with an attachment
//! circlesync post create 2 "hello friends" --file photo.png
//!
//! # Follow a peer met out of band
//! circlesync peer introduce <node_id> --addr 192.168.1.20:4433
//!
//! # Seal pending content and sign the next manifest
//! circlesync publish
//!
//! # Run as a persistent P2P node
//! circlesync serve
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use circlesync_core::logging::init_logging;
use circlesync_core::{
    BlobHash, CircleId, CircleSyncEngine, NodeId, SyncConfig, SyncEvent, TopicKey,
};

/// CircleSync - encrypted circles over P2P gossip
#[derive(Parser)]
#[command(name = "circlesync")]
#[command(version = "0.1.0")]
#[command(about = "CircleSync - encrypted circles over P2P gossip")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.circlesync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML config file; --data-dir overrides its data_dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Circle management
    Circle {
        #[command(subcommand)]
        action: CircleAction,
    },

    /// Posts
    Post {
        #[command(subcommand)]
        action: PostAction,
    },

    /// Peers this node follows
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },

    /// Seal pending content and sign the next manifest
    Publish,

    /// Retry attachments that failed to download
    Maintain,

    /// Start serving/syncing as a persistent P2P node
    Serve {
        /// Publish pending changes once the node is up
        #[arg(long)]
        publish: bool,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Set the display name, creating the identity on first use
    SetName { name: String },
}

#[derive(Subcommand)]
enum CircleAction {
    /// Create a circle with a fresh key
    Create { name: String },
    /// List circles and their members
    List,
    /// Add a peer and send them the circle key
    AddMember {
        circle: CircleId,
        /// Peer node id (hex)
        node_id: String,
    },
    /// Remove a peer; the circle key is rotated
    RemoveMember {
        circle: CircleId,
        node_id: String,
    },
    /// Replace the circle key and re-seal own content
    Rotate { circle: CircleId },
}

#[derive(Subcommand)]
enum PostAction {
    /// Write a post into a circle
    Create {
        circle: CircleId,
        text: String,
        /// Hash of the post being replied to
        #[arg(long)]
        parent: Option<String>,
        /// Attach a file (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
    /// List posts, newest first
    List,
}

#[derive(Subcommand)]
enum PeerAction {
    /// Record an out-of-band introduction
    Introduce {
        /// Peer node id (hex)
        node_id: String,
        /// Topic key (hex); derived from the node id when omitted
        #[arg(long)]
        topic: Option<String>,
        /// Direct address (repeatable)
        #[arg(long = "addr")]
        addresses: Vec<String>,
        #[arg(long)]
        relay: Option<String>,
    },
    /// List followed peers and their sync progress
    List,
}

/// Get the default data directory (~/.circlesync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".circlesync")
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::with_data_dir(default_data_dir()),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn parse_node_id(s: &str) -> Result<NodeId> {
    NodeId::from_hex(s).map_err(|e| anyhow::anyhow!("Invalid node ID '{}': {}", s, e))
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") | Some("md") => "text/plain",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn require_identity(engine: &CircleSyncEngine) -> Result<()> {
    if engine.local_identity().is_err() {
        anyhow::bail!("No identity yet. Run: circlesync identity set-name <name>");
    }
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::AnnouncementPublished { version, manifest_hash } => {
            println!("Published version {} ({})", version, manifest_hash)
        }
        SyncEvent::AnnouncementIgnored { peer, version, reason } => {
            println!("Ignored v{} from {}: {}", version, peer.short(), reason)
        }
        SyncEvent::ManifestApplied {
            peer,
            version,
            posts_added,
            reactions_applied,
            actions_processed,
        } => println!(
            "Synced v{} from {}: {} posts, {} reactions, {} actions",
            version,
            peer.short(),
            posts_added,
            reactions_applied,
            actions_processed
        ),
        SyncEvent::ManifestFailed { peer, version, error } => {
            println!("Sync of v{} from {} failed: {}", version, peer.short(), error)
        }
        SyncEvent::PeerSubscribed { peer } => println!("Following {}", peer.short()),
        SyncEvent::PeerJoined { peer } => println!("Peer joined: {}", peer.short()),
        SyncEvent::PeerLeft { peer } => println!("Peer left: {}", peer.short()),
        SyncEvent::KeyReceived { peer, circle } => match circle {
            Some(circle) => println!("Received key for circle {} from {}", circle, peer.short()),
            None => println!("Received key from {}", peer.short()),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let data_dir = config.data_dir.clone();

    match cli.command {
        Commands::Info => {
            let engine = CircleSyncEngine::open_offline(config).await?;
            let info = engine.info()?;

            println!("CircleSync v0.1.0");
            println!();
            println!("Identity:");
            match &info.display_name {
                Some(name) => println!("  Name: {}", name),
                None => println!("  Name: (not set)"),
            }
            println!();
            println!("Node:");
            println!("  ID: {}", info.node_id);
            println!("  Topic: {}", info.topic_key.to_hex());
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Manifest version: {}", info.version);
            println!("Circles: {}", engine.list_circles()?.len());
            println!("Peers: {}", engine.list_peers()?.len());
            engine.shutdown().await?;
        }

        Commands::Identity { action } => match action {
            IdentityAction::SetName { name } => {
                let engine = CircleSyncEngine::open_offline(config).await?;
                let identity = engine.onboard(&name)?;
                println!("Identity: {}", identity.display_name);
                println!("  Node: {}", engine.node_id());
                engine.shutdown().await?;
            }
        },

        Commands::Circle { action } => {
            let engine = CircleSyncEngine::open_offline(config).await?;
            require_identity(&engine)?;
            match action {
                CircleAction::Create { name } => {
                    let circle = engine.create_circle(&name)?;
                    println!("Created circle:");
                    println!("  ID: {}", circle.id);
                    println!("  Name: {}", circle.name);
                }
                CircleAction::List => {
                    let circles = engine.list_circles()?;
                    println!("Circles ({}):", circles.len());
                    for circle in circles {
                        let members = engine.circle_members(circle.id)?;
                        let tag = if circle.is_everyone { " (everyone)" } else { "" };
                        println!("  {} {}{} - {} members", circle.id, circle.name, tag, members.len());
                        for member in members {
                            println!("      {} {}", member.owner_node_id.short(), member.display_name);
                        }
                    }
                }
                CircleAction::AddMember { circle, node_id } => {
                    let peer = parse_node_id(&node_id)?;
                    if engine.add_member(circle, &peer)? {
                        println!("Added {} to circle {}", peer.short(), circle);
                    } else {
                        println!("{} is already in circle {}", peer.short(), circle);
                    }
                }
                CircleAction::RemoveMember { circle, node_id } => {
                    let peer = parse_node_id(&node_id)?;
                    if engine.remove_member(circle, &peer).await? {
                        println!("Removed {} from circle {}; key rotated", peer.short(), circle);
                    } else {
                        println!("{} is not in circle {}", peer.short(), circle);
                    }
                }
                CircleAction::Rotate { circle } => {
                    let handle = engine.rotate_circle_key(circle).await?;
                    println!("Rotated key for circle {} (key #{})", circle, handle.id);
                }
            }
            engine.shutdown().await?;
        }

        Commands::Post { action } => {
            let engine = CircleSyncEngine::open_offline(config).await?;
            require_identity(&engine)?;
            match action {
                PostAction::Create {
                    circle,
                    text,
                    parent,
                    files,
                } => {
                    let parent = parent
                        .map(|p| BlobHash::parse(&p))
                        .transpose()
                        .context("Invalid parent hash")?;
                    let mut attachments = Vec::with_capacity(files.len());
                    for path in &files {
                        let data = std::fs::read(path)
                            .with_context(|| format!("Cannot read {}", path.display()))?;
                        attachments.push((guess_mime(path).to_string(), Bytes::from(data)));
                    }
                    let post = engine.create_post(circle, &text, parent, attachments).await?;
                    println!("Created post:");
                    println!("  ID: {}", post.id);
                    println!("  Circle: {}", circle);
                    println!("  Files: {}", post.files.len());
                }
                PostAction::List => {
                    let posts = engine.list_posts()?;
                    println!("Posts ({}):", posts.len());
                    for post in posts {
                        let author = engine
                            .storage()
                            .load_identity(post.author_identity_id)?
                            .map(|i| i.display_name)
                            .unwrap_or_else(|| "?".to_string());
                        let hash = post
                            .blob_hash
                            .as_ref()
                            .map(|h| h.to_string())
                            .unwrap_or_else(|| "(unpublished)".to_string());
                        println!("  [{}] {}: {}", post.id, author, post.text);
                        println!("      {}", hash);
                    }
                }
            }
            engine.shutdown().await?;
        }

        Commands::Peer { action } => {
            let engine = CircleSyncEngine::open_offline(config).await?;
            match action {
                PeerAction::Introduce {
                    node_id,
                    topic,
                    addresses,
                    relay,
                } => {
                    let peer = parse_node_id(&node_id)?;
                    let topic = topic
                        .map(|t| TopicKey::from_hex(&t))
                        .transpose()
                        .map_err(|e| anyhow::anyhow!("Invalid topic key: {}", e))?;
                    let stored = engine.introduce_peer(peer, topic, addresses, relay).await?;
                    println!("Introduced peer:");
                    println!("  ID: {}", stored.peer_node_id);
                    println!("  Topic: {}", stored.topic_key.to_hex());
                }
                PeerAction::List => {
                    let peers = engine.list_peers()?;
                    println!("Peers ({}):", peers.len());
                    for peer in peers {
                        let name = engine
                            .storage()
                            .find_identity_by_owner(&peer.peer_node_id)?
                            .map(|i| i.display_name)
                            .unwrap_or_default();
                        let version = peer
                            .last_known_version
                            .map(|v| format!("v{}", v))
                            .unwrap_or_else(|| "never synced".to_string());
                        let synced = peer
                            .last_synced_at
                            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default();
                        println!("  {} {} {} {}", peer.peer_node_id.short(), name, version, synced);
                    }
                }
            }
            engine.shutdown().await?;
        }

        Commands::Publish => {
            let engine = CircleSyncEngine::open_offline(config).await?;
            require_identity(&engine)?;
            let announcement = engine.publish().await?;
            println!("Signed manifest:");
            println!("  Version: {}", announcement.version);
            println!("  Hash: {}", announcement.manifest_hash);
            println!();
            println!("Run `circlesync serve` to share it with peers.");
            engine.shutdown().await?;
        }

        Commands::Maintain => {
            let engine = CircleSyncEngine::open_with_iroh(config).await?;
            engine.start().await?;
            let recovered = engine.run_maintenance().await?;
            println!("Recovered {} attachments", recovered);
            engine.shutdown().await?;
        }

        Commands::Serve { publish } => {
            println!("Starting CircleSync...");
            println!();

            let engine = CircleSyncEngine::open_with_iroh(config).await?;
            require_identity(&engine)?;
            let mut events = engine.subscribe_events();
            engine.start().await?;

            let info = engine.info()?;
            println!("Node:");
            println!("  ID: {}", info.node_id);
            println!("  Topic: {}", info.topic_key.to_hex());
            for addr in &info.addresses {
                println!("  Address: {}", addr);
            }
            if let Some(relay) = &info.relay_url {
                println!("  Relay: {}", relay);
            }
            println!();

            if publish {
                let announcement = engine.publish().await?;
                println!("Published version {}", announcement.version);
            }

            println!("Data directory: {}", data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            engine.shutdown().await?;
            println!("Goodbye!");
        }
    }

    Ok(())
}
