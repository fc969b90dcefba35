//! PocketSizedUniverse node daemon

use anyhow::{Context, Result};
use clap::Parser;
use psu_crypto::NodeIdentity;
use psu_node::{identity, logging, parse_peer, Config, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// PocketSizedUniverse P2P node
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(short, long, env = "PSU_CONFIG", default_value = "psu-node.toml")]
    config: PathBuf,

    /// Override node.listen_address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Additional bootstrap peer as <node-id>@<address>; repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Serve as a relay for other peers
    #[arg(long)]
    relay: bool,

    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.node.listen_address = listen;
    }
    config.node.bootstrap.extend(args.bootstrap);
    config.relay.enabled |= args.relay;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    logging::init(&config.logging)?;
    psu_crypto::init().context("initializing libsodium")?;

    let identity = match &config.node.key_file {
        Some(path) => identity::load_or_generate(path)?,
        None => {
            warn!("No node.key_file configured, using an ephemeral identity");
            NodeIdentity::generate()?
        }
    };

    let node = Node::start(config.clone(), identity).await?;
    info!("Node id {}", node.node_id().to_hex());

    if !config.node.bootstrap.is_empty() {
        match node.bootstrap().await {
            Ok(size) => info!("Bootstrapped, {} nodes in routing table", size),
            Err(e) => warn!("Bootstrap failed: {}", e),
        }
    }
    if let Some(relay) = &config.relay.join {
        let relay = parse_peer(relay)?;
        match node.join_relay(relay.clone()).await {
            Ok(known) => info!("Joined relay {}, {} relays known", relay.node_id, known.len()),
            Err(e) => warn!("Joining relay {} failed: {}", relay.node_id, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
