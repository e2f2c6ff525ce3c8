//! # Server Middleware - Distributed System Coordination
//!
//! The middleware layer handles all distributed system concerns of a node:
//!
//! ## Core Responsibilities
//!
//! ### 1. Discovery & Membership
//! - Announces itself with a `HELLO` on the multicast group
//! - Refreshes the membership table from hellos, heartbeats and announcements
//!
//! ### 2. Failure Detection ([`heartbeat`])
//! - Broadcasts a heartbeat every interval
//! - Sweeps peers unseen for longer than the failure timeout
//! - Forgets a stale primary and starts an election
//!
//! ### 3. Leader Election ([`election`])
//! - Bully algorithm: the live node with the greatest id becomes primary
//! - Timeout driven, no quorum and no term
//!
//! ### 4. Replication ([`replication`])
//! - Primary: accepts backup links and pushes full snapshots after each change
//! - Backup: follows the current primary and replaces its state with every push
//!
//! ### 5. Client Sessions ([`session`])
//! - Primary serves moves; backups redirect; with no primary, clients only watch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      ServerMiddleware               │
//! │  (Election, Heartbeats, Sessions,   │
//! │   Replication)                      │
//! │  ┌───────────────────────────────┐  │
//! │  │       ServerCore              │  │
//! │  │  (Game State Store Only)      │  │
//! │  └───────────────────────────────┘  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Shared State
//!
//! | State | Guard |
//! |---|---|
//! | membership table | `tokio::sync::RwLock` |
//! | primary flag + known primary | `tokio::sync::watch` (awaitable) |
//! | replication links | `tokio::sync::Mutex` inside [`ReplicationLinks`] |
//! | client sessions | `tokio::sync::Mutex` inside [`session::SessionRegistry`] |
//! | game state | `std::sync::Mutex` inside [`ServerCore`] |

mod election;
mod heartbeat;
mod replication;
mod session;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::common::messages::DiscoveryMessage;
use crate::common::shutdown::ShutdownTrigger;
use crate::discovery::{DiscoveryBus, DiscoveryListener};
use crate::server::config::ServerConfig;
use crate::server::links::ReplicationLinks;
use crate::server::membership::MembershipTable;
use crate::server::role::{PrimaryInfo, RoleState};
use crate::server::server::ServerCore;

use session::SessionRegistry;

/// Sockets bound by [`ServerMiddleware::bind`] and consumed by [`ServerMiddleware::run`].
struct BoundSockets {
    clients: TcpListener,
    replication: TcpListener,
    inbox: DiscoveryListener,
}

/// Server middleware that handles all distributed system coordination.
///
/// The middleware delegates the game itself to [`ServerCore`].
pub struct ServerMiddleware {
    node_id: u32,

    /// Configuration loaded from TOML / CLI
    config: ServerConfig,

    /// Game state store
    core: Arc<ServerCore>,

    /// Send side of the discovery channel
    discovery: DiscoveryBus,

    /// Peers seen recently
    membership: RwLock<MembershipTable>,

    /// Primary flag and the currently known primary
    role: watch::Sender<RoleState>,

    /// Open links to backups (only populated while primary)
    links: ReplicationLinks,

    /// Connected clients
    sessions: SessionRegistry,

    /// Set while an election round is running on this node
    electing: AtomicBool,

    shutdown: ShutdownTrigger,

    sockets: Mutex<Option<BoundSockets>>,
    client_addr: SocketAddr,
    replication_addr: SocketAddr,
}

impl ServerMiddleware {
    /// Bind the client and replication listeners and build the middleware.
    ///
    /// Nothing runs until [`ServerMiddleware::run`] is called.
    ///
    /// # Example
    /// ```ignore
    /// let (bus, inbox) = DiscoveryBus::multicast(&config.discovery)?;
    /// let core = Arc::new(ServerCore::new(id, GameState::new(3, 3)));
    /// let server = ServerMiddleware::bind(config, core, bus, inbox).await?;
    /// server.run().await;
    /// ```
    pub async fn bind(
        config: ServerConfig,
        core: Arc<ServerCore>,
        discovery: DiscoveryBus,
        inbox: DiscoveryListener,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = config.node_id()?;
        let host = config.server.bind_host.as_str();

        let clients = TcpListener::bind((host, config.server.tcp_port))
            .await
            .with_context(|| format!("binding client port {}:{}", host, config.server.tcp_port))?;
        let replication = TcpListener::bind((host, config.server.replication_port))
            .await
            .with_context(|| {
                format!(
                    "binding replication port {}:{}",
                    host, config.server.replication_port
                )
            })?;
        let client_addr = clients.local_addr()?;
        let replication_addr = replication.local_addr()?;

        let (role, _) = watch::channel(RoleState::default());

        Ok(Arc::new(Self {
            node_id,
            config,
            core,
            discovery,
            membership: RwLock::new(MembershipTable::new()),
            role,
            links: ReplicationLinks::new(),
            sessions: SessionRegistry::new(),
            electing: AtomicBool::new(false),
            shutdown: ShutdownTrigger::new(),
            sockets: Mutex::new(Some(BoundSockets {
                clients,
                replication,
                inbox,
            })),
            client_addr,
            replication_addr,
        }))
    }

    /// Main entry point - runs every long-lived task until shutdown.
    ///
    /// This method:
    /// 1. Broadcasts a `HELLO`
    /// 2. Schedules the startup election
    /// 3. Runs the discovery listener, heartbeat beacon, failure sweep,
    ///    client and replication accept loops, and the backup follower
    ///
    /// Returns once [`ServerMiddleware::shutdown`] has been called and every
    /// loop has unwound.
    pub async fn run(self: &Arc<Self>) {
        let sockets = self
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sockets) = sockets else {
            warn!("⚠️  Server {} is already running", self.node_id);
            return;
        };

        info!(
            "🚀 Server {} starting: clients on {}, replication on {}",
            self.node_id, self.client_addr, self.replication_addr
        );

        self.broadcast(DiscoveryMessage::Hello {
            node_id: self.node_id,
            tcp_port: self.client_addr.port(),
            replication_port: self.replication_addr.port(),
        })
        .await;

        let server = self.clone();
        tokio::spawn(async move {
            server.startup_election().await;
        });

        tokio::join!(
            self.discovery_loop(sockets.inbox),
            self.heartbeat_loop(),
            self.sweep_loop(),
            self.accept_clients(sockets.clients),
            self.accept_replication(sockets.replication),
            self.follow_primary(),
        );

        self.links.clear().await;
        info!("👋 Server {} stopped", self.node_id);
    }

    /// Ask every loop to stop. Sockets close as the loops unwind.
    pub fn shutdown(&self) {
        info!("🛑 Server {} shutting down", self.node_id);
        self.shutdown.trigger();
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn replication_addr(&self) -> SocketAddr {
        self.replication_addr
    }

    pub fn role_state(&self) -> RoleState {
        self.role.borrow().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.role.borrow().is_primary
    }

    pub fn primary(&self) -> Option<PrimaryInfo> {
        self.role.borrow().primary.clone()
    }

    /// Ids of the peers currently in the membership table.
    pub async fn peer_ids(&self) -> Vec<u32> {
        self.membership.read().await.node_ids()
    }

    /// Ids of the backups with an open replication link to this node.
    pub async fn backup_ids(&self) -> Vec<u32> {
        self.links.node_ids().await
    }

    /// How this node advertises itself when it is primary.
    fn self_info(&self) -> PrimaryInfo {
        PrimaryInfo {
            node_id: self.node_id,
            host: self.config.server.advertise_host.clone(),
            tcp_port: self.client_addr.port(),
            replication_port: self.replication_addr.port(),
        }
    }

    async fn highest_live_id(&self) -> u32 {
        self.membership.read().await.highest_live_id(self.node_id)
    }

    async fn broadcast(&self, message: DiscoveryMessage) {
        if let Err(e) = self.discovery.broadcast(&message).await {
            warn!(
                "⚠️  Server {} failed to broadcast {:?}: {}",
                self.node_id, message, e
            );
        }
    }

    // ========================================================================
    // DISCOVERY - dispatch inbound control datagrams
    // ========================================================================

    async fn discovery_loop(self: &Arc<Self>, mut inbox: DiscoveryListener) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let next = tokio::select! {
                next = inbox.next() => next,
                _ = shutdown.wait() => break,
            };
            let Some((message, source)) = next else {
                warn!("⚠️  Server {} discovery channel closed", self.node_id);
                break;
            };

            // Our own datagrams come back on multicast loopback
            if message.node_id() == self.node_id {
                continue;
            }
            self.handle_discovery(message, source.ip().to_string()).await;
        }
    }

    /// Apply one control datagram. Every branch is safe to repeat.
    async fn handle_discovery(self: &Arc<Self>, message: DiscoveryMessage, host: String) {
        match message {
            DiscoveryMessage::Hello {
                node_id,
                tcp_port,
                replication_port,
            } => {
                self.membership.write().await.refresh(
                    node_id,
                    host,
                    tcp_port,
                    replication_port,
                    Instant::now(),
                );
                info!("👋 Server {} met Server {}", self.node_id, node_id);

                // Let the newcomer learn who is primary without an election
                if self.is_primary() {
                    self.become_primary().await;
                }
            }

            DiscoveryMessage::Heartbeat {
                node_id,
                tcp_port,
                replication_port,
            } => {
                let is_new = self.membership.write().await.refresh(
                    node_id,
                    host,
                    tcp_port,
                    replication_port,
                    Instant::now(),
                );
                if is_new {
                    info!("🤝 Server {} discovered Server {}", self.node_id, node_id);
                } else {
                    debug!(
                        "💓 Server {} received heartbeat from {}",
                        self.node_id, node_id
                    );
                }
            }

            DiscoveryMessage::PrimaryAnnounce {
                node_id,
                tcp_port,
                replication_port,
            } => {
                self.membership.write().await.refresh(
                    node_id,
                    host.clone(),
                    tcp_port,
                    replication_port,
                    Instant::now(),
                );
                self.on_primary_announce(PrimaryInfo {
                    node_id,
                    host,
                    tcp_port,
                    replication_port,
                })
                .await;
            }

            DiscoveryMessage::Election { node_id } => {
                self.on_election(node_id).await;
            }

            DiscoveryMessage::ElectionAck { node_id } => {
                debug!(
                    "👋 Server {} received ELECTION_OK from {}",
                    self.node_id, node_id
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::discovery::LoopbackHub;
    use crate::game::GameState;
    use std::time::Duration;

    /// Fast timings so tests settle in well under a second.
    pub fn fast_config(id: u32) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.id = Some(id);
        config.server.bind_host = "127.0.0.1".into();
        config.server.tcp_port = 0;
        config.server.replication_port = 0;
        config.election.heartbeat_interval_ms = 50;
        config.election.sweep_interval_ms = 50;
        config.election.failure_timeout_ms = 200;
        config.election.announce_wait_ms = 200;
        config.election.settle_window_ms = 150;
        config.election.startup_delay_ms = 150;
        config.election.reconnect_interval_ms = 50;
        config
    }

    pub async fn node_on(hub: &LoopbackHub, config: ServerConfig) -> Arc<ServerMiddleware> {
        let (bus, inbox) = DiscoveryBus::loopback(hub);
        let id = config.node_id().unwrap();
        let core = Arc::new(ServerCore::new(id, GameState::with_blanks(3, &[(0, 0)])));
        ServerMiddleware::bind(config, core, bus, inbox).await.unwrap()
    }

    /// Poll `check` until it holds or `timeout` passes.
    pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}
