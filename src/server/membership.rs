//! # Membership Table
//!
//! The local, eventually pruned view of which peers are reachable. Refreshed
//! by hellos, heartbeats and primary announcements; pruned by the failure
//! detector sweep.
//!
//! The table itself is plain data. [`ServerMiddleware`](super::middleware::ServerMiddleware)
//! keeps it behind a `RwLock` so refresh, prune and read never race.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// What we know about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: u32,
    /// Source address of the peer's last datagram
    pub host: String,
    pub tcp_port: u16,
    pub replication_port: u16,
    pub last_seen: Instant,
}

impl NodeRecord {
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, Default)]
pub struct MembershipTable {
    nodes: HashMap<u32, NodeRecord>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns `true` if the peer was not known.
    pub fn refresh(
        &mut self,
        node_id: u32,
        host: String,
        tcp_port: u16,
        replication_port: u16,
        now: Instant,
    ) -> bool {
        let record = NodeRecord {
            node_id,
            host,
            tcp_port,
            replication_port,
            last_seen: now,
        };
        self.nodes.insert(node_id, record).is_none()
    }

    /// Whether `node_id` is present and was seen within `timeout`.
    pub fn is_live(&self, node_id: u32, timeout: Duration, now: Instant) -> bool {
        self.nodes
            .get(&node_id)
            .map(|record| !record.is_stale(timeout, now))
            .unwrap_or(false)
    }

    /// Drop every peer unseen for longer than `timeout`, returning their ids.
    pub fn remove_stale(&mut self, timeout: Duration, now: Instant) -> Vec<u32> {
        let stale: Vec<u32> = self
            .nodes
            .values()
            .filter(|record| record.is_stale(timeout, now))
            .map(|record| record.node_id)
            .collect();

        for node_id in &stale {
            self.nodes.remove(node_id);
        }
        stale
    }

    /// Greatest id among the known peers and the local node.
    pub fn highest_live_id(&self, self_id: u32) -> u32 {
        self.nodes.keys().copied().fold(self_id, u32::max)
    }

    pub fn node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(3);

    #[test]
    fn refresh_inserts_then_updates() {
        let mut table = MembershipTable::new();
        let t0 = Instant::now();

        assert!(table.refresh(2, "10.0.0.2".into(), 9002, 9102, t0));
        assert!(!table.refresh(2, "10.0.0.2".into(), 9002, 9102, t0 + TIMEOUT));
        assert_eq!(table.node_ids(), vec![2]);
        // Liveness counts from the second refresh
        assert!(table.is_live(2, TIMEOUT, t0 + TIMEOUT + TIMEOUT));
    }

    #[test]
    fn highest_live_id_includes_self() {
        let mut table = MembershipTable::new();
        let now = Instant::now();
        assert_eq!(table.highest_live_id(4), 4);

        table.refresh(1, "a".into(), 1, 1, now);
        table.refresh(7, "b".into(), 1, 1, now);
        assert_eq!(table.highest_live_id(4), 7);
        assert_eq!(table.highest_live_id(9), 9);
    }

    #[test]
    fn sweep_removes_only_stale_peers() {
        let mut table = MembershipTable::new();
        let t0 = Instant::now();
        table.refresh(1, "a".into(), 1, 1, t0);
        table.refresh(2, "b".into(), 1, 1, t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_millis(3500);
        assert!(!table.is_live(1, TIMEOUT, now));
        assert!(table.is_live(2, TIMEOUT, now));

        assert_eq!(table.remove_stale(TIMEOUT, now), vec![1]);
        assert_eq!(table.node_ids(), vec![2]);
        assert!(!table.is_live(1, TIMEOUT, now));
    }

    #[test]
    fn age_equal_to_timeout_is_still_live() {
        let mut table = MembershipTable::new();
        let t0 = Instant::now();
        table.refresh(5, "a".into(), 1, 1, t0);
        assert!(table.remove_stale(TIMEOUT, t0 + TIMEOUT).is_empty());
    }
}
