//! # Failure Detection
//!
//! Every node beacons a `HEARTBEAT` each interval. The sweep drops peers not
//! heard from within the failure timeout; if the known primary is among them
//! (or was never heard from at all) it is forgotten and an election starts.
//! An election also starts when a peer is dropped while no primary is known,
//! since the node this one deferred to may be the peer that just died.

use log::{debug, warn};
use std::sync::Arc;
use tokio::time::Instant;

use super::ServerMiddleware;
use crate::common::messages::DiscoveryMessage;

impl ServerMiddleware {
    pub(super) async fn heartbeat_loop(&self) {
        let interval = self.config.election.heartbeat_interval();
        loop {
            self.broadcast(DiscoveryMessage::Heartbeat {
                node_id: self.node_id,
                tcp_port: self.client_addr.port(),
                replication_port: self.replication_addr.port(),
            })
            .await;
            debug!("💓 Server {} sent heartbeat", self.node_id);

            if !self.sleep_unless_shutdown(interval).await {
                break;
            }
        }
    }

    pub(super) async fn sweep_loop(self: &Arc<Self>) {
        let interval = self.config.election.sweep_interval();
        while self.sleep_unless_shutdown(interval).await {
            self.sweep().await;
        }
    }

    /// One failure-detection pass.
    pub(super) async fn sweep(self: &Arc<Self>) {
        let timeout = self.config.election.failure_timeout();
        let now = Instant::now();

        let stale = self.membership.write().await.remove_stale(timeout, now);
        for node_id in &stale {
            warn!(
                "⚠️  Server {} detected peer {} may have failed (no heartbeat for {:?})",
                self.node_id, node_id, timeout
            );
        }

        let primary_id = self.role.borrow().primary_id();
        let Some(primary_id) = primary_id else {
            if !stale.is_empty() {
                warn!(
                    "⚠️  Server {} has no PRIMARY and lost peers {:?}! Starting election",
                    self.node_id, stale
                );
                self.trigger_election();
            }
            return;
        };
        if primary_id == self.node_id {
            return;
        }
        if self.membership.read().await.is_live(primary_id, timeout, now) {
            return;
        }

        if self.role.send_if_modified(|state| state.clear_primary(primary_id)) {
            warn!(
                "⚠️  Server {} lost PRIMARY {}! Starting election",
                self.node_id, primary_id
            );
            self.trigger_election();
        }
    }
}
