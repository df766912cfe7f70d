//! Trellis node binary
//!
//! Loads configuration, starts the peer, and runs until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use trellis::{NodeConfig, Peer};

#[derive(Parser, Debug)]
#[command(name = "trellis", about = "Trust-gated Kademlia overlay node")]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bootstrap service URL; overrides the config file. Pass an empty
    /// string to start without a bootstrap.
    #[arg(long)]
    bootstrap: Option<String>,

    /// WebSocket listener bind address; overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Local store snapshot path; overrides the config file.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Identity file path; overrides the config file.
    #[arg(long)]
    identity: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(bootstrap) = cli.bootstrap {
        config.node.bootstrap_url = if bootstrap.is_empty() {
            None
        } else {
            Some(bootstrap)
        };
    }
    if let Some(listen) = cli.listen {
        config.node.listen_addr = Some(listen);
    }
    if let Some(store) = cli.store {
        config.node.store_path = Some(store);
    }
    if let Some(identity) = cli.identity {
        config.node.identity_path = Some(identity);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "trellis node");
    let peer = Peer::start(config).await?;

    tokio::signal::ctrl_c().await?;
    peer.shutdown().await;
    Ok(())
}
