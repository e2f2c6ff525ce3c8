//! # Server Configuration
//!
//! Loaded from TOML with [`load_config`](crate::common::config::load_config);
//! every field has a default so a file only needs what differs.
//!
//! # Example TOML
//!
//! ```toml
//! [server]
//! id = 2
//! tcp_port = 9002
//! replication_port = 9102
//!
//! [election]
//! heartbeat_interval_ms = 500
//! failure_timeout_ms = 1500
//!
//! [game]
//! board_size = 4
//! blanks = 6
//! ```

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::config::DiscoveryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Information about THIS server
    pub server: ServerInfo,
    /// Multicast group shared with peers and clients
    pub discovery: DiscoveryConfig,
    /// Failure detection and election timing
    pub election: ElectionConfig,
    /// Initial puzzle
    pub game: GameConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique, totally ordered node id. The greatest live id becomes primary.
    pub id: Option<u32>,
    /// Interface the TCP listeners bind on
    pub bind_host: String,
    /// Host put into our own primary announcement and client redirects
    pub advertise_host: String,
    /// Client-facing port (0 picks a free port)
    pub tcp_port: u16,
    /// Replication port (0 picks a free port)
    pub replication_port: u16,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            id: None,
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            tcp_port: 9001,
            replication_port: 9101,
        }
    }
}

/// Election timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// How often to broadcast heartbeats
    pub heartbeat_interval_ms: u64,
    /// How often to look for stale peers
    pub sweep_interval_ms: u64,
    /// How long before a silent peer is considered failed
    pub failure_timeout_ms: u64,
    /// How long a non-maximal node waits for a primary announcement
    pub announce_wait_ms: u64,
    /// How long an election round is left to settle before re-checking
    pub settle_window_ms: u64,
    /// Delay before the first election, so heartbeats can fill membership
    pub startup_delay_ms: u64,
    /// How often a backup retries its replication link
    pub reconnect_interval_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            sweep_interval_ms: 1000,
            failure_timeout_ms: 3000,
            announce_wait_ms: 3000,
            settle_window_ms: 2000,
            startup_delay_ms: 1500,
            reconnect_interval_ms: 1000,
        }
    }
}

impl ElectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    pub fn announce_wait(&self) -> Duration {
        Duration::from_millis(self.announce_wait_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub board_size: usize,
    /// Number of cells blanked at startup
    pub blanks: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            board_size: 3,
            blanks: 3,
        }
    }
}

impl ServerConfig {
    /// The node id, which has no sensible default.
    pub fn node_id(&self) -> Result<u32> {
        match self.server.id {
            Some(id) => Ok(id),
            None => bail!("server id is required (set [server] id or pass --id)"),
        }
    }

    /// Reject settings the cluster can not run with.
    pub fn validate(&self) -> Result<()> {
        self.node_id()?;
        if self.game.board_size == 0 {
            bail!("game.board_size must be at least 1");
        }
        let e = &self.election;
        if e.heartbeat_interval_ms == 0 || e.sweep_interval_ms == 0 || e.reconnect_interval_ms == 0 {
            bail!("election intervals must be non-zero");
        }
        if e.failure_timeout_ms <= e.heartbeat_interval_ms {
            bail!(
                "election.failure_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                e.failure_timeout_ms,
                e.heartbeat_interval_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_one_second_heartbeats() {
        let config = ServerConfig::default();
        assert_eq!(config.election.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.election.failure_timeout(), Duration::from_secs(3));
        assert_eq!(config.election.announce_wait(), Duration::from_secs(3));
        assert_eq!(config.election.settle_window(), Duration::from_secs(2));
        assert_eq!(config.server.tcp_port, 9001);
        assert_eq!(config.discovery.port, 5007);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            id = 2
            tcp_port = 9002

            [game]
            board_size = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id().unwrap(), 2);
        assert_eq!(config.server.tcp_port, 9002);
        assert_eq!(config.server.replication_port, 9101);
        assert_eq!(config.game.board_size, 4);
        assert_eq!(config.game.blanks, 3);
        config.validate().unwrap();
    }

    #[test]
    fn missing_id_fails_validation() {
        assert!(ServerConfig::default().validate().is_err());
    }

    #[test]
    fn timeout_must_exceed_heartbeat() {
        let mut config = ServerConfig::default();
        config.server.id = Some(1);
        config.election.failure_timeout_ms = 500;
        assert!(config.validate().is_err());
    }
}
