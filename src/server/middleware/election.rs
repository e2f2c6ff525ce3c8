//! # Leader Election (Bully Algorithm)
//!
//! 1. A node that sees itself as the greatest live id takes the primary role
//!    and announces it right away.
//! 2. Otherwise it waits `announce_wait` for a `PRIMARY` announcement.
//! 3. If none arrives it broadcasts `ELECTION`, waits `settle_window`, and
//!    takes the role only if no primary showed up and it is still the greatest
//!    live id.
//!
//! A node receiving `ELECTION` from a smaller id answers `ELECTION_OK` and
//! runs its own round. So does a node that hears a smaller id announce
//! itself primary: a late joiner with the greatest id takes over that way.
//! A node that deferred in step 3 gets a new round from the failure sweep
//! if the peer it deferred to disappears. At most one round runs per node at
//! a time.

use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::ServerMiddleware;
use crate::common::messages::DiscoveryMessage;
use crate::server::role::PrimaryInfo;

impl ServerMiddleware {
    /// First election after startup, once heartbeats had a chance to fill
    /// the membership table. Runs even when a primary is already known.
    pub(super) async fn startup_election(self: &Arc<Self>) {
        if !self.sleep_unless_shutdown(self.config.election.startup_delay()).await {
            return;
        }
        self.run_election().await;
    }

    /// Start an election round in the background.
    pub(super) fn trigger_election(self: &Arc<Self>) {
        if self.shutdown.is_triggered() {
            return;
        }
        let server = self.clone();
        tokio::spawn(async move {
            server.run_election().await;
        });
    }

    /// Run one round unless another is already in progress on this node.
    pub(super) async fn run_election(&self) {
        if self.electing.swap(true, Ordering::SeqCst) {
            debug!("Server {} already has an election in progress", self.node_id);
            return;
        }
        self.election_round().await;
        self.electing.store(false, Ordering::SeqCst);
    }

    async fn election_round(&self) {
        info!("🗳️  Server {} starting election", self.node_id);

        let highest = self.highest_live_id().await;
        if highest == self.node_id {
            self.become_primary().await;
            return;
        }

        info!(
            "⏳ Server {} sees higher Server {}, waiting for its announcement",
            self.node_id, highest
        );
        if self.wait_for_primary(self.config.election.announce_wait()).await {
            return;
        }
        if self.shutdown.is_triggered() {
            return;
        }

        info!(
            "📤 Server {} heard no announcement, broadcasting ELECTION",
            self.node_id
        );
        self.broadcast(DiscoveryMessage::Election {
            node_id: self.node_id,
        })
        .await;

        if !self.sleep_unless_shutdown(self.config.election.settle_window()).await {
            return;
        }

        if let Some(primary) = self.primary() {
            info!(
                "✅ Server {} election settled on Server {}",
                self.node_id, primary.node_id
            );
            return;
        }

        let highest = self.highest_live_id().await;
        if highest == self.node_id {
            self.become_primary().await;
        } else {
            info!(
                "⏳ Server {} defers to Server {}, no primary yet",
                self.node_id, highest
            );
        }
    }

    /// Take the primary role and announce it. Calling it again while already
    /// primary simply re-announces.
    pub(super) async fn become_primary(&self) {
        let me = self.self_info();
        let promoted = self.role.send_if_modified(|state| {
            let already = state.is_primary && state.primary.as_ref() == Some(&me);
            state.promote(me.clone());
            !already
        });

        if promoted {
            info!("🎉 Server {} is now PRIMARY", self.node_id);
        } else {
            debug!("Server {} re-announcing PRIMARY", self.node_id);
        }

        self.broadcast(DiscoveryMessage::PrimaryAnnounce {
            node_id: me.node_id,
            tcp_port: me.tcp_port,
            replication_port: me.replication_port,
        })
        .await;
    }

    /// Adopt an announced primary. If that demotes this node, its backup
    /// links close. A smaller announcer is always challenged with a fresh
    /// election.
    pub(super) async fn on_primary_announce(self: &Arc<Self>, announced: PrimaryInfo) {
        let announcer = announced.node_id;
        let mut demoted = false;
        let changed = self.role.send_if_modified(|state| {
            let before = state.clone();
            demoted = state.accept_announcement(self.node_id, announced);
            *state != before
        });

        if changed {
            info!(
                "👑 Server {} acknowledges Server {} as PRIMARY",
                self.node_id, announcer
            );
        }
        if demoted {
            warn!(
                "⚠️  Server {} stepping down, Server {} announced itself PRIMARY",
                self.node_id, announcer
            );
            self.links.clear().await;
        }
        if announcer < self.node_id {
            info!(
                "🗳️  Server {} outranks announced Server {}, challenging",
                self.node_id, announcer
            );
            self.trigger_election();
        }
    }

    /// Bully a smaller node out of its election.
    pub(super) async fn on_election(self: &Arc<Self>, from: u32) {
        if from >= self.node_id {
            debug!(
                "Server {} ignores ELECTION from higher Server {}",
                self.node_id, from
            );
            return;
        }

        info!(
            "🗳️  Server {} received ELECTION from lower Server {}, answering",
            self.node_id, from
        );
        self.broadcast(DiscoveryMessage::ElectionAck {
            node_id: self.node_id,
        })
        .await;
        self.trigger_election();
    }

    /// Wait until some primary is known. Returns `false` on timeout or shutdown.
    async fn wait_for_primary(&self, window: Duration) -> bool {
        let mut role = self.role.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let known = async { role.wait_for(|state| state.primary.is_some()).await.is_ok() };

        tokio::select! {
            res = tokio::time::timeout(window, known) => res.unwrap_or(false),
            _ = shutdown.wait() => false,
        }
    }

    /// Sleep for `duration`. Returns `false` if shutdown cut it short.
    pub(super) async fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{eventually, fast_config, node_on};
    use super::*;
    use crate::discovery::{DiscoveryBus, LoopbackHub};
    use crate::server::role::Role;
    use tokio::time::Instant;

    /// Listen on the hub like a peer would, without running a node.
    fn observer(hub: &LoopbackHub) -> (DiscoveryBus, crate::discovery::DiscoveryListener) {
        DiscoveryBus::loopback(hub)
    }

    async fn next_of_kind<F>(
        inbox: &mut crate::discovery::DiscoveryListener,
        mut wanted: F,
    ) -> Option<DiscoveryMessage>
    where
        F: FnMut(&DiscoveryMessage) -> bool,
    {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            while let Some((message, _)) = inbox.next().await {
                if wanted(&message) {
                    return Some(message);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn lone_node_becomes_primary_and_announces() {
        let hub = LoopbackHub::new();
        let (_peer, mut inbox) = observer(&hub);
        let node = node_on(&hub, fast_config(4)).await;

        node.run_election().await;

        assert!(node.is_primary());
        assert_eq!(node.role_state().role(), Role::Primary);
        let announce = next_of_kind(&mut inbox, |m| {
            matches!(m, DiscoveryMessage::PrimaryAnnounce { .. })
        })
        .await;
        assert!(matches!(
            announce,
            Some(DiscoveryMessage::PrimaryAnnounce { node_id: 4, .. })
        ));

        // One round, one announcement
        let again = tokio::time::timeout(Duration::from_millis(100), inbox.next()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn lower_node_broadcasts_election_and_defers_to_live_higher_peer() {
        let hub = LoopbackHub::new();
        let (_peer, mut inbox) = observer(&hub);
        let node = node_on(&hub, fast_config(1)).await;
        node.membership
            .write()
            .await
            .refresh(9, "127.0.0.1".into(), 1, 2, Instant::now());

        node.run_election().await;

        let election = next_of_kind(&mut inbox, |m| {
            matches!(m, DiscoveryMessage::Election { .. })
        })
        .await;
        assert_eq!(election, Some(DiscoveryMessage::Election { node_id: 1 }));
        assert!(!node.is_primary());
        assert!(node.primary().is_none());
    }

    #[tokio::test]
    async fn announcement_during_wait_ends_the_round() {
        let hub = LoopbackHub::new();
        let node = node_on(&hub, fast_config(2)).await;
        node.membership
            .write()
            .await
            .refresh(7, "127.0.0.1".into(), 1, 2, Instant::now());

        let round = {
            let node = node.clone();
            tokio::spawn(async move { node.run_election().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.on_primary_announce(PrimaryInfo {
            node_id: 7,
            host: "127.0.0.1".into(),
            tcp_port: 1,
            replication_port: 2,
        })
        .await;
        round.await.unwrap();

        assert!(!node.is_primary());
        assert_eq!(node.role_state().primary_id(), Some(7));
    }

    #[tokio::test]
    async fn election_from_lower_node_is_answered() {
        let hub = LoopbackHub::new();
        let (_peer, mut inbox) = observer(&hub);
        let node = node_on(&hub, fast_config(5)).await;

        node.on_election(3).await;

        let ack = next_of_kind(&mut inbox, |m| {
            matches!(m, DiscoveryMessage::ElectionAck { .. })
        })
        .await;
        assert_eq!(ack, Some(DiscoveryMessage::ElectionAck { node_id: 5 }));
        // The triggered round finds no higher peer
        assert!(eventually(Duration::from_secs(1), || node.is_primary()).await);
    }

    #[tokio::test]
    async fn election_from_higher_node_is_ignored() {
        let hub = LoopbackHub::new();
        let node = node_on(&hub, fast_config(2)).await;

        node.on_election(8).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!node.is_primary());
    }

    #[tokio::test]
    async fn primary_steps_down_for_higher_announcer() {
        let hub = LoopbackHub::new();
        let node = node_on(&hub, fast_config(3)).await;
        node.become_primary().await;
        assert!(node.is_primary());

        node.on_primary_announce(PrimaryInfo {
            node_id: 6,
            host: "127.0.0.1".into(),
            tcp_port: 1,
            replication_port: 2,
        })
        .await;

        assert!(!node.is_primary());
        assert_eq!(node.role_state().primary_id(), Some(6));
        assert_eq!(node.role_state().role(), Role::Backup);
    }

    #[tokio::test]
    async fn primary_reclaims_role_from_lower_announcer() {
        let hub = LoopbackHub::new();
        let node = node_on(&hub, fast_config(6)).await;
        node.become_primary().await;

        node.on_primary_announce(PrimaryInfo {
            node_id: 2,
            host: "127.0.0.1".into(),
            tcp_port: 1,
            replication_port: 2,
        })
        .await;
        assert!(!node.is_primary());

        // Node 2 is not in membership, so node 6 wins its new round at once
        assert!(eventually(Duration::from_secs(1), || node.is_primary()).await);
    }

    #[tokio::test]
    async fn backup_challenges_lower_announcer() {
        let hub = LoopbackHub::new();
        let (_peer, mut inbox) = observer(&hub);
        let node = node_on(&hub, fast_config(3)).await;
        node.membership
            .write()
            .await
            .refresh(2, "127.0.0.1".into(), 1, 2, Instant::now());

        node.on_primary_announce(PrimaryInfo {
            node_id: 2,
            host: "127.0.0.1".into(),
            tcp_port: 1,
            replication_port: 2,
        })
        .await;

        assert!(eventually(Duration::from_secs(1), || node.is_primary()).await);
        let announce = next_of_kind(&mut inbox, |m| {
            matches!(m, DiscoveryMessage::PrimaryAnnounce { node_id: 3, .. })
        })
        .await;
        assert!(announce.is_some());
    }

    #[tokio::test]
    async fn startup_round_runs_with_primary_already_known() {
        let hub = LoopbackHub::new();
        let node = node_on(&hub, fast_config(5)).await;
        node.role.send_modify(|state| {
            state.accept_announcement(
                5,
                PrimaryInfo {
                    node_id: 4,
                    host: "127.0.0.1".into(),
                    tcp_port: 1,
                    replication_port: 2,
                },
            );
        });
        assert_eq!(node.role_state().primary_id(), Some(4));

        node.startup_election().await;

        assert!(node.is_primary());
        assert_eq!(node.role_state().primary_id(), Some(5));
    }
}
