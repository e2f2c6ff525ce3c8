//! # Primary-Backup Replication
//!
//! Backups dial the primary's replication port, send `REPL_HELLO`, and then
//! only listen. The primary answers with its current snapshot and afterwards
//! pushes a `STATE_UPDATE` for every state change (see
//! [`ReplicationLinks::push`](crate::server::links::ReplicationLinks::push)).
//! A backup applies each snapshot wholesale.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::ServerMiddleware;
use crate::common::connection::{Connection, FrameError};
use crate::common::messages::ReplicationMessage;
use crate::server::role::{PrimaryInfo, RoleState};

/// How long a freshly connected backup has to identify itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolve once this node no longer holds the primary role.
async fn stepped_down(role: &mut watch::Receiver<RoleState>) {
    let _ = role.wait_for(|state| !state.is_primary).await;
}

/// Resolve once `primary_id` is no longer the primary this node follows.
async fn primary_changed(role: &mut watch::Receiver<RoleState>, primary_id: u32) {
    let _ = role
        .wait_for(|state| state.is_primary || state.primary_id() != Some(primary_id))
        .await;
}

impl ServerMiddleware {
    // ========================================================================
    // PRIMARY SIDE
    // ========================================================================

    pub(super) async fn accept_replication(self: &Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_backup(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("❌ Server {} replication accept error: {}", self.node_id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_backup(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut conn = Connection::new(stream);
        let mut shutdown = self.shutdown.subscribe();

        let hello = tokio::select! {
            hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.read_message::<ReplicationMessage>()) => hello,
            _ = shutdown.wait() => return,
        };
        let backup_id = match hello {
            Ok(Ok(Some(ReplicationMessage::Hello { node_id }))) => node_id,
            Ok(Ok(Some(other))) => {
                warn!(
                    "⚠️  Server {} expected REPL_HELLO from {}, got {:?}",
                    self.node_id, addr, other
                );
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!("⚠️  Server {} bad replication handshake from {}: {}", self.node_id, addr, e);
                return;
            }
            Err(_) => {
                warn!("⚠️  Server {} replication handshake from {} timed out", self.node_id, addr);
                return;
            }
        };

        if !self.is_primary() {
            info!(
                "Server {} is not PRIMARY, refusing replication link from Server {}",
                self.node_id, backup_id
            );
            return;
        }

        let (mut reader, writer) = conn.into_split();
        let token = match self
            .links
            .insert_synced(backup_id, writer, || self.core.snapshot())
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!("⚠️  Initial sync to backup {} failed: {}", backup_id, e);
                return;
            }
        };
        info!(
            "🔗 Server {} linked backup Server {} for replication",
            self.node_id, backup_id
        );

        // Backups never write after the handshake; reading only tells us when
        // the link goes away.
        let mut role = self.role.subscribe();
        loop {
            let next = tokio::select! {
                next = reader.read_message::<ReplicationMessage>() => next,
                _ = stepped_down(&mut role) => break,
                _ = shutdown.wait() => break,
            };
            match next {
                Ok(Some(message)) => debug!(
                    "Server {} ignoring {:?} from backup {}",
                    self.node_id, message, backup_id
                ),
                Ok(None) => break,
                Err(FrameError::Malformed(e)) => {
                    debug!("Unreadable frame from backup {}: {}", backup_id, e)
                }
                Err(e) => {
                    debug!("Replication link to backup {} failed: {}", backup_id, e);
                    break;
                }
            }
        }

        if self.links.remove(backup_id, token).await {
            info!(
                "🔌 Server {} closed replication link to backup Server {}",
                self.node_id, backup_id
            );
        }
    }

    // ========================================================================
    // BACKUP SIDE
    // ========================================================================

    /// Keep a replication link open to whichever node is primary while this
    /// node is a backup.
    pub(super) async fn follow_primary(&self) {
        let interval = self.config.election.reconnect_interval();
        while self.sleep_unless_shutdown(interval).await {
            let role = self.role_state();
            if role.is_primary {
                continue;
            }
            let Some(primary) = role.primary else {
                continue;
            };
            if primary.node_id == self.node_id {
                continue;
            }

            match self.replicate_from(&primary).await {
                Ok(()) => debug!(
                    "Server {} replication link to Server {} ended",
                    self.node_id, primary.node_id
                ),
                Err(e) => warn!(
                    "⚠️  Server {} replication from PRIMARY {} failed: {:#}",
                    self.node_id, primary.node_id, e
                ),
            }
        }
    }

    async fn replicate_from(&self, primary: &PrimaryInfo) -> Result<()> {
        let addr = primary.replication_addr();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .with_context(|| format!("connecting to {}", addr))?
            .with_context(|| format!("connecting to {}", addr))?;

        let mut conn = Connection::new(stream);
        conn.write_message(&ReplicationMessage::Hello {
            node_id: self.node_id,
        })
        .await?;
        info!(
            "📡 Server {} following PRIMARY Server {} at {}",
            self.node_id, primary.node_id, addr
        );

        let mut role = self.role.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let next = tokio::select! {
                next = conn.read_message::<ReplicationMessage>() => next,
                _ = primary_changed(&mut role, primary.node_id) => return Ok(()),
                _ = shutdown.wait() => return Ok(()),
            };
            match next {
                Ok(Some(ReplicationMessage::StateUpdate { state })) => {
                    info!(
                        "📥 Server {} applied replicated state v{}",
                        self.node_id, state.version
                    );
                    self.core.replace_state(state);
                }
                Ok(Some(other)) => debug!("Server {} ignoring {:?}", self.node_id, other),
                Ok(None) => return Ok(()),
                Err(FrameError::Malformed(e)) => {
                    debug!("Unreadable replication frame: {}", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{fast_config, node_on};
    use super::*;
    use crate::discovery::LoopbackHub;

    async fn idle_node(id: u32) -> Arc<ServerMiddleware> {
        let hub = LoopbackHub::new();
        let mut config = fast_config(id);
        config.election.startup_delay_ms = 60_000;
        config.election.failure_timeout_ms = 60_000;
        let node = node_on(&hub, config).await;
        let runner = node.clone();
        tokio::spawn(async move { runner.run().await });
        node
    }

    #[tokio::test]
    async fn backup_is_synced_on_connect() {
        let primary = idle_node(2).await;
        primary.become_primary().await;
        primary.core().apply_move("zed", 0, 0, 1);

        let mut conn = Connection::new(
            TcpStream::connect(primary.replication_addr()).await.unwrap(),
        );
        conn.write_message(&ReplicationMessage::Hello { node_id: 1 })
            .await
            .unwrap();

        let first = conn.read_message::<ReplicationMessage>().await.unwrap();
        assert_eq!(
            first,
            Some(ReplicationMessage::StateUpdate {
                state: primary.core().snapshot()
            })
        );
        let linked = tokio::time::timeout(Duration::from_secs(1), async {
            while !primary.backup_ids().await.contains(&1) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(linked.is_ok());

        primary.shutdown();
    }

    #[tokio::test]
    async fn non_primary_refuses_backups() {
        let node = idle_node(2).await;

        let mut conn = Connection::new(TcpStream::connect(node.replication_addr()).await.unwrap());
        conn.write_message(&ReplicationMessage::Hello { node_id: 1 })
            .await
            .unwrap();

        let reply = conn.read_message::<ReplicationMessage>().await.unwrap();
        assert!(reply.is_none());
        assert!(node.backup_ids().await.is_empty());

        node.shutdown();
    }

    #[tokio::test]
    async fn stepping_down_closes_backup_links() {
        let primary = idle_node(2).await;
        primary.become_primary().await;

        let mut conn = Connection::new(
            TcpStream::connect(primary.replication_addr()).await.unwrap(),
        );
        conn.write_message(&ReplicationMessage::Hello { node_id: 1 })
            .await
            .unwrap();
        conn.read_message::<ReplicationMessage>().await.unwrap();

        primary
            .on_primary_announce(PrimaryInfo {
                node_id: 5,
                host: "127.0.0.1".into(),
                tcp_port: 1,
                replication_port: 2,
            })
            .await;

        let after = tokio::time::timeout(
            Duration::from_secs(2),
            conn.read_message::<ReplicationMessage>(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(after.is_none());

        primary.shutdown();
    }
}
