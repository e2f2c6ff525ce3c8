//! # Primary Role State
//!
//! The local primary/backup flag together with the currently known primary.
//! Both live in one value so they always change together;
//! [`ServerMiddleware`](super::middleware::ServerMiddleware) publishes it
//! through a `tokio::sync::watch` channel so tasks can await role changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where to find the primary. Trusted as received, never verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryInfo {
    pub node_id: u32,
    pub host: String,
    pub tcp_port: u16,
    pub replication_port: u16,
}

impl PrimaryInfo {
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    pub fn replication_addr(&self) -> String {
        format!("{}:{}", self.host, self.replication_port)
    }
}

impl fmt::Display for PrimaryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server {} at {} (replication {})",
            self.node_id,
            self.client_addr(),
            self.replication_port
        )
    }
}

/// How a node should treat client connections right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node accepts moves and pushes replication
    Primary,
    /// Another node is primary, clients get redirected there
    Backup,
    /// No primary known, clients may only watch
    Spectator,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleState {
    pub is_primary: bool,
    pub primary: Option<PrimaryInfo>,
}

impl RoleState {
    pub fn role(&self) -> Role {
        match (self.is_primary, &self.primary) {
            (true, _) => Role::Primary,
            (false, Some(_)) => Role::Backup,
            (false, None) => Role::Spectator,
        }
    }

    pub fn primary_id(&self) -> Option<u32> {
        self.primary.as_ref().map(|p| p.node_id)
    }

    /// Take the primary role, pointing `primary` at ourselves.
    pub fn promote(&mut self, me: PrimaryInfo) {
        self.is_primary = true;
        self.primary = Some(me);
    }

    /// Record an announced primary. Last writer wins.
    ///
    /// Returns `true` if this node held the primary role and lost it.
    pub fn accept_announcement(&mut self, self_id: u32, announced: PrimaryInfo) -> bool {
        let demoted = self.is_primary && announced.node_id != self_id;
        if demoted {
            self.is_primary = false;
        }
        self.primary = Some(announced);
        demoted
    }

    /// Forget the primary if it is still `node_id`. Returns whether it was.
    pub fn clear_primary(&mut self, node_id: u32) -> bool {
        if self.primary_id() == Some(node_id) {
            self.primary = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(node_id: u32) -> PrimaryInfo {
        PrimaryInfo {
            node_id,
            host: "127.0.0.1".into(),
            tcp_port: 9000 + node_id as u16,
            replication_port: 9100 + node_id as u16,
        }
    }

    #[test]
    fn roles_follow_flag_and_primary() {
        let mut state = RoleState::default();
        assert_eq!(state.role(), Role::Spectator);

        state.accept_announcement(1, info(3));
        assert_eq!(state.role(), Role::Backup);

        state.promote(info(1));
        assert_eq!(state.role(), Role::Primary);
        assert_eq!(state.primary_id(), Some(1));
    }

    #[test]
    fn announcement_from_another_node_demotes() {
        let mut state = RoleState::default();
        state.promote(info(2));

        assert!(!state.accept_announcement(2, info(2)));
        assert!(state.is_primary);

        assert!(state.accept_announcement(2, info(3)));
        assert!(!state.is_primary);
        assert_eq!(state.primary_id(), Some(3));
    }

    #[test]
    fn clear_only_matching_primary() {
        let mut state = RoleState::default();
        state.accept_announcement(1, info(3));

        assert!(!state.clear_primary(2));
        assert_eq!(state.primary_id(), Some(3));
        assert!(state.clear_primary(3));
        assert_eq!(state.role(), Role::Spectator);
    }

    #[test]
    fn addresses_render_host_and_ports() {
        let p = info(3);
        assert_eq!(p.client_addr(), "127.0.0.1:9003");
        assert_eq!(p.replication_addr(), "127.0.0.1:9103");
    }
}
