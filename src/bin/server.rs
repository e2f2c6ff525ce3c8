//! # Server Binary Entry Point
//!
//! Thin wrapper that initializes and runs one cluster node.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin server -- --id 1 --tcp-port 9001 --replication-port 9101
//! cargo run --bin server -- --config config/server2.toml
//! ```
//!
//! The server will:
//! 1. Load configuration from the TOML file (if any) and apply CLI overrides
//! 2. Initialize the server core with a fresh puzzle
//! 3. Join the multicast discovery group
//! 4. Run discovery, heartbeats, elections, replication and client sessions
//!    until Ctrl-C

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use latin_cluster::common::config::load_config;
use latin_cluster::common::logging::init_logger;
use latin_cluster::discovery::DiscoveryBus;
use latin_cluster::game::GameState;
use latin_cluster::server::{ServerConfig, ServerCore, ServerMiddleware};

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Node id; the greatest live id becomes primary
    #[arg(long)]
    id: Option<u32>,

    /// Client-facing TCP port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Replication TCP port
    #[arg(long)]
    replication_port: Option<u16>,

    /// Host announced to peers and clients
    #[arg(long)]
    advertise_host: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config: ServerConfig = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(id) = self.id {
            config.server.id = Some(id);
        }
        if let Some(port) = self.tcp_port {
            config.server.tcp_port = port;
        }
        if let Some(port) = self.replication_port {
            config.server.replication_port = port;
        }
        if let Some(host) = self.advertise_host {
            config.server.advertise_host = host;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = Args::parse().into_config()?;
    let node_id = config.node_id()?;

    let game = GameState::new(config.game.board_size, config.game.blanks);
    let core = Arc::new(ServerCore::new(node_id, game));

    let (bus, inbox) = DiscoveryBus::multicast(&config.discovery)
        .with_context(|| format!("joining multicast group {}", config.discovery.group_addr()))?;
    let middleware = ServerMiddleware::bind(config, core, bus, inbox).await?;

    let stopper = middleware.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("🛑 Ctrl-C received"),
            Err(e) => error!("❌ Failed to listen for Ctrl-C: {}", e),
        }
        stopper.shutdown();
    });

    middleware.run().await;
    Ok(())
}
