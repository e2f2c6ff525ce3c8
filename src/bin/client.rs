//! # Client Binary Entry Point
//!
//! Interactive terminal client for the puzzle cluster.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin client -- --name alice
//! cargo run --bin client -- --name bob --host 127.0.0.1 --port 9002
//! ```
//!
//! Without `--host` the client listens on the multicast group for a primary
//! announcement and falls back to `127.0.0.1`. Commands: `move r c val`,
//! `state`, `exit`.

use clap::Parser;
use std::sync::Arc;

use latin_cluster::client::{ClientCore, ClientMiddleware};
use latin_cluster::common::config::DiscoveryConfig;
use latin_cluster::common::logging::init_logger;

/// Command-line arguments for the client binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Player name shown on the scoreboard
    #[arg(long)]
    name: String,

    /// Server host; skips multicast discovery
    #[arg(long)]
    host: Option<String>,

    /// Server client port
    #[arg(long, default_value_t = 9001)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let core = Arc::new(ClientCore::new(args.name));
    let middleware = ClientMiddleware::new(core, DiscoveryConfig::default());

    middleware.run(args.host, args.port).await
}
