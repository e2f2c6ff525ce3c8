//! # Replication Links (primary side)
//!
//! The set of open primary -> backup channels, keyed by the backup's node id.
//! A link enters the set when a backup completes its handshake and has been
//! sent the current snapshot. The snapshot is taken and written while the set
//! is locked, so no push can slip between the initial sync and the insert.
//! A link leaves it
//! on the first failed write, when its reader sees the backup hang up, when
//! the primary steps down, or at shutdown.
//!
//! Every link carries a token so a stale reader can not remove the newer
//! link that replaced it after the backup reconnected.

use log::{info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::common::connection::{FrameError, FrameWriter};
use crate::common::messages::ReplicationMessage;
use crate::game::GameState;

/// A backup that does not drain its socket within this window is dropped.
const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct Link<W> {
    token: u64,
    writer: FrameWriter<W>,
}

pub struct ReplicationLinks<W = OwnedWriteHalf> {
    links: Mutex<HashMap<u32, Link<W>>>,
    next_token: AtomicU64,
}

impl<W: AsyncWrite + Unpin> ReplicationLinks<W> {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Send `snapshot()` to a new backup and register its link, replacing
    /// (and closing) any previous one. Returns the token identifying this link.
    pub async fn insert_synced<F>(
        &self,
        node_id: u32,
        mut writer: FrameWriter<W>,
        snapshot: F,
    ) -> Result<u64, FrameError>
    where
        F: FnOnce() -> GameState,
    {
        let mut links = self.links.lock().await;

        let update = ReplicationMessage::StateUpdate { state: snapshot() };
        match tokio::time::timeout(PUSH_TIMEOUT, writer.write_message(&update)).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if links.insert(node_id, Link { token, writer }).is_some() {
            info!("🔁 Replaced replication link for backup {}", node_id);
        }
        Ok(token)
    }

    /// Remove the link for `node_id` if it is still the one identified by `token`.
    pub async fn remove(&self, node_id: u32, token: u64) -> bool {
        let mut links = self.links.lock().await;
        match links.get(&node_id) {
            Some(link) if link.token == token => {
                links.remove(&node_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every link, closing the sockets.
    pub async fn clear(&self) {
        self.links.lock().await.clear();
    }

    pub async fn node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.links.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Push a full snapshot to every connected backup.
    ///
    /// A link whose write fails or stalls is removed right away; the push
    /// still reaches the remaining links. Returns how many backups got it.
    pub async fn push(&self, state: &GameState) -> usize {
        let update = ReplicationMessage::StateUpdate {
            state: state.clone(),
        };

        let mut links = self.links.lock().await;
        let mut failed = Vec::new();
        for (node_id, link) in links.iter_mut() {
            match tokio::time::timeout(PUSH_TIMEOUT, link.writer.write_message(&update)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("⚠️  Replication write to backup {} failed: {}", node_id, e);
                    failed.push(*node_id);
                }
                Err(_) => {
                    warn!("⚠️  Replication write to backup {} timed out", node_id);
                    failed.push(*node_id);
                }
            }
        }

        for node_id in &failed {
            links.remove(node_id);
        }
        links.len()
    }
}

impl<W: AsyncWrite + Unpin> Default for ReplicationLinks<W> {
    fn default() -> Self {
        Self::new()
    }
}
