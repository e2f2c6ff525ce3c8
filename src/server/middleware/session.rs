//! # Client Sessions
//!
//! One task per TCP client. The first message names the player; after that
//! the node's role decides what happens:
//!
//! | Role | Behaviour |
//! |---|---|
//! | Primary | `STATE` with note `primary`, then moves are served |
//! | Backup | one `REDIRECT` to the primary, then the connection closes |
//! | No primary known | `STATE` with note `spectator`, moves answer `not_primary` |
//!
//! Each session writes through its own queue so the primary can fan a new
//! snapshot out to every other session without blocking on slow sockets.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use super::ServerMiddleware;
use crate::common::connection::{Connection, FrameError, FrameWriter};
use crate::common::messages::{ClientRequest, ErrorCode, MoveResult, ServerMessage, SessionNote};
use crate::server::role::Role;

/// Player name for sessions that never said hello with a name.
pub const DEFAULT_PLAYER: &str = "anon";

/// Outbound messages queued per session before the session counts as stuck.
const SESSION_QUEUE: usize = 64;

struct ClientHandle {
    name: String,
    tx: mpsc::Sender<ServerMessage>,
}

/// Live client sessions on this node.
pub(crate) struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, ClientHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, name: String, tx: mpsc::Sender<ServerMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .await
            .insert(id, ClientHandle { name, tx });
        id
    }

    async fn deregister(&self, id: u64) {
        self.sessions.lock().await.remove(&id);
    }

    /// Queue `message` for every session except `except`. Sessions whose
    /// writer is gone are dropped; full queues skip this message.
    async fn broadcast_except(&self, except: u64, message: &ServerMessage) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|id, handle| {
            if *id == except {
                return true;
            }
            match handle.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("⚠️  Client '{}' is not keeping up, skipping update", handle.name);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Drain a session's queue onto its socket.
async fn write_session(mut writer: FrameWriter<OwnedWriteHalf>, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.write_message(&message).await {
            debug!("Client write failed: {}", e);
            break;
        }
    }
}

impl ServerMiddleware {
    pub(super) async fn accept_clients(self: &Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("🔌 Server {} accepted client {}", self.node_id, addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_client(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("❌ Server {} client accept error: {}", self.node_id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut conn = Connection::new(stream);
        let mut shutdown = self.shutdown.subscribe();

        let first = tokio::select! {
            first = conn.read_message::<ClientRequest>() => first,
            _ = shutdown.wait() => return,
        };
        let (name, pending) = match first {
            Ok(Some(ClientRequest::Hello { name })) => {
                (name.unwrap_or_else(|| DEFAULT_PLAYER.to_string()), None)
            }
            Ok(Some(other)) => (DEFAULT_PLAYER.to_string(), Some(other)),
            Ok(None) => {
                debug!("Client {} left before saying hello", addr);
                return;
            }
            Err(FrameError::Malformed(e)) => {
                warn!("⚠️  Client {} sent an unreadable first message: {}", addr, e);
                let _ = conn
                    .write_message(&ServerMessage::Error {
                        error: ErrorCode::Unknown,
                    })
                    .await;
                return;
            }
            Err(e) => {
                warn!("⚠️  Client {} connection failed: {}", addr, e);
                return;
            }
        };

        self.core.register_player(&name);

        let role = self.role_state();
        let note = match role.role() {
            Role::Primary => SessionNote::Primary,
            Role::Spectator => SessionNote::Spectator,
            Role::Backup => {
                if let Some(primary) = role.primary {
                    info!(
                        "↪️  Server {} redirecting '{}' to PRIMARY {}",
                        self.node_id,
                        name,
                        primary.client_addr()
                    );
                    let redirect = ServerMessage::Redirect {
                        host: primary.host,
                        port: primary.tcp_port,
                        reason: "not_primary".to_string(),
                    };
                    if let Err(e) = conn.write_message(&redirect).await {
                        debug!("Redirect to {} failed: {}", addr, e);
                    }
                }
                return;
            }
        };

        info!(
            "🎮 Server {} serving '{}' from {} ({:?})",
            self.node_id, name, addr, note
        );

        let (mut reader, writer) = conn.into_split();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let writer_task = tokio::spawn(write_session(writer, rx));
        let session_id = self.sessions.register(name.clone(), tx.clone()).await;
        debug!(
            "Server {} has {} client session(s)",
            self.node_id,
            self.sessions.len().await
        );

        let _ = tx
            .send(ServerMessage::State {
                state: self.core.snapshot(),
                note: Some(note),
            })
            .await;
        if let Some(request) = pending {
            self.handle_request(session_id, &name, request, &tx).await;
        }

        loop {
            let next = tokio::select! {
                next = reader.read_message::<ClientRequest>() => next,
                _ = shutdown.wait() => break,
            };
            match next {
                Ok(Some(request)) => self.handle_request(session_id, &name, request, &tx).await,
                Ok(None) => {
                    info!("👋 Client '{}' disconnected from Server {}", name, self.node_id);
                    break;
                }
                Err(FrameError::Malformed(e)) => {
                    debug!("Unreadable request from '{}': {}", name, e);
                    let _ = tx
                        .send(ServerMessage::Error {
                            error: ErrorCode::Unknown,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("⚠️  Session for '{}' ended: {}", name, e);
                    break;
                }
            }
        }

        self.sessions.deregister(session_id).await;
        drop(tx);
        let _ = writer_task.await;
    }

    async fn handle_request(
        &self,
        session_id: u64,
        name: &str,
        request: ClientRequest,
        tx: &mpsc::Sender<ServerMessage>,
    ) {
        let reply = match request {
            ClientRequest::GetState => ServerMessage::State {
                state: self.core.snapshot(),
                note: None,
            },

            ClientRequest::Move { .. } if !self.is_primary() => ServerMessage::Error {
                error: ErrorCode::NotPrimary,
            },

            ClientRequest::Move { r, c, val } => {
                let (outcome, state) = self.core.apply_move(name, r, c, val);

                if outcome.is_accepted() {
                    let update = ServerMessage::State {
                        state: state.clone(),
                        note: None,
                    };
                    self.sessions.broadcast_except(session_id, &update).await;
                }
                if outcome.changed_state() {
                    let reached = self.links.push(&state).await;
                    debug!(
                        "📤 Server {} replicated v{} to {} backup(s)",
                        self.node_id, state.version, reached
                    );
                }

                ServerMessage::MoveAck {
                    result: if outcome.is_accepted() {
                        MoveResult::Ok
                    } else {
                        MoveResult::Fail
                    },
                    reason: outcome.rejection(),
                    state,
                }
            }

            ClientRequest::Hello { .. } => ServerMessage::Error {
                error: ErrorCode::Unknown,
            },
        };

        if tx.send(reply).await.is_err() {
            debug!("Client '{}' writer is gone", name);
        }
    }
}
