//! # Client Core
//!
//! Opens one session against one server: connect, say `HELLO`, and read the
//! first reply. Finding the primary and following redirects belong to the
//! [`ClientMiddleware`](super::middleware::ClientMiddleware).

use anyhow::{bail, Context, Result};
use log::info;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::common::connection::Connection;
use crate::common::messages::{ClientRequest, ServerMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// What a server said to our `HELLO`.
pub enum JoinOutcome {
    /// The server serves us. `initial` is its first message, normally a
    /// `STATE` carrying the session note.
    Joined {
        conn: Connection,
        initial: ServerMessage,
    },
    /// The server is a backup; the primary lives at `host:port`.
    Redirected { host: String, port: u16 },
}

pub struct ClientCore {
    /// Player name sent in `HELLO`
    name: String,
}

impl ClientCore {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect to `host:port` and introduce ourselves.
    pub async fn join(&self, host: &str, port: u16) -> Result<JoinOutcome> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .with_context(|| format!("timed out connecting to {}", addr))?
            .with_context(|| format!("failed to connect to {}", addr))?;
        let mut conn = Connection::new(stream);

        conn.write_message(&ClientRequest::Hello {
            name: Some(self.name.clone()),
        })
        .await?;

        let reply = tokio::time::timeout(REPLY_TIMEOUT, conn.read_message::<ServerMessage>())
            .await
            .with_context(|| format!("no response from {}", addr))??;

        match reply {
            Some(ServerMessage::Redirect { host, port, reason }) => {
                info!(
                    "↪️  {} redirected by {} to {}:{} ({})",
                    self.name, addr, host, port, reason
                );
                Ok(JoinOutcome::Redirected { host, port })
            }
            Some(initial) => {
                info!("✅ {} joined the game at {}", self.name, addr);
                Ok(JoinOutcome::Joined { conn, initial })
            }
            None => bail!("{} closed the connection without replying", addr),
        }
    }
}
