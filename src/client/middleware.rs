//! # Client Middleware
//!
//! Everything around the single session the [`ClientCore`] opens:
//! - **Primary discovery**: listen briefly on the multicast group for a
//!   `PRIMARY` announcement
//! - **Redirects**: a backup answers with `REDIRECT`; reconnect to the named
//!   primary, a bounded number of times
//! - **Interactive loop**: stdin commands out, server pushes printed as they
//!   arrive

use anyhow::{bail, Result};
use log::{info, warn};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::client::{ClientCore, JoinOutcome};
use crate::client::terminal::{self, Command};
use crate::common::config::DiscoveryConfig;
use crate::common::connection::Connection;
use crate::common::messages::{ClientRequest, DiscoveryMessage, ServerMessage};
use crate::discovery::{DiscoveryBus, DiscoveryListener};

/// Redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 3;

/// How long to listen for a primary announcement.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

const REDIRECT_PAUSE: Duration = Duration::from_millis(200);

/// Wait up to `window` for a `PRIMARY` datagram. Returns the sender's IP and
/// the announced client port.
pub async fn discover_primary(inbox: &mut DiscoveryListener, window: Duration) -> Option<(String, u16)> {
    let search = async {
        while let Some((message, source)) = inbox.next().await {
            if let DiscoveryMessage::PrimaryAnnounce { tcp_port, .. } = message {
                return Some((source.ip().to_string(), tcp_port));
            }
        }
        None
    };
    tokio::time::timeout(window, search).await.ok().flatten()
}

pub struct ClientMiddleware {
    core: Arc<ClientCore>,
    discovery: DiscoveryConfig,
}

impl ClientMiddleware {
    pub fn new(core: Arc<ClientCore>, discovery: DiscoveryConfig) -> Self {
        Self { core, discovery }
    }

    /// Pick the server to dial: the explicit host if given, else whoever
    /// announces itself as primary, else localhost.
    pub async fn locate(&self, host: Option<String>, port: u16) -> (String, u16) {
        if let Some(host) = host {
            return (host, port);
        }

        println!("Discovering primary via multicast for {}s...", DISCOVERY_WINDOW.as_secs());
        match DiscoveryBus::multicast(&self.discovery) {
            Ok((_bus, mut inbox)) => {
                if let Some((host, port)) = discover_primary(&mut inbox, DISCOVERY_WINDOW).await {
                    println!("Found primary at {}:{}", host, port);
                    return (host, port);
                }
            }
            Err(e) => warn!("⚠️  Multicast discovery unavailable: {:#}", e),
        }

        println!("No primary discovered; using default 127.0.0.1");
        ("127.0.0.1".to_string(), port)
    }

    /// Join the game at `host:port`, following redirects.
    pub async fn connect(&self, mut host: String, mut port: u16) -> Result<(Connection, ServerMessage)> {
        for _ in 0..=MAX_REDIRECTS {
            match self.core.join(&host, port).await? {
                JoinOutcome::Joined { conn, initial } => return Ok((conn, initial)),
                JoinOutcome::Redirected {
                    host: next_host,
                    port: next_port,
                } => {
                    println!("Server redirected to primary {}:{}", next_host, next_port);
                    host = next_host;
                    port = next_port;
                    tokio::time::sleep(REDIRECT_PAUSE).await;
                }
            }
        }
        bail!("gave up after {} redirects", MAX_REDIRECTS)
    }

    /// Run the interactive session until `exit`, end of input, or the server
    /// hanging up.
    pub async fn run(&self, host: Option<String>, port: u16) -> Result<()> {
        let (host, port) = self.locate(host, port).await;
        let (conn, initial) = self.connect(host, port).await?;
        println!("{}", terminal::describe(&initial));

        let (mut reader, mut writer) = conn.into_split();
        let mut printer = tokio::spawn(async move {
            loop {
                match reader.read_message::<ServerMessage>().await {
                    Ok(Some(message)) => println!("{}", terminal::describe(&message)),
                    Ok(None) => {
                        println!("server closed");
                        break;
                    }
                    Err(e) => {
                        println!("reader error {}", e);
                        break;
                    }
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{}", terminal::PROMPT);
            let _ = std::io::stdout().flush();

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = &mut printer => break,
            };
            let Some(line) = line else {
                break;
            };

            let request = match terminal::parse_command(&line) {
                Ok(Some(Command::Exit)) => break,
                Ok(Some(Command::State)) => ClientRequest::GetState,
                Ok(Some(Command::Move { r, c, val })) => ClientRequest::Move { r, c, val },
                Ok(None) => continue,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };
            if let Err(e) = writer.write_message(&request).await {
                warn!("⚠️  {} lost the server: {}", self.core.name(), e);
                break;
            }
        }

        printer.abort();
        info!("👋 {} leaving the game", self.core.name());
        Ok(())
    }
}
