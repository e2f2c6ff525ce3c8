//! # Configuration Utilities
//!
//! Shared configuration structures and parsing utilities used by both
//! client and server components.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Example
/// ```ignore
/// let config: ServerConfig = load_config("config/server1.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
    let config: T =
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path))?;
    Ok(config)
}

/// Multicast group used for discovery, heartbeats and elections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// IPv4 multicast group (e.g. "224.1.1.1")
    pub group: Ipv4Addr,
    /// UDP port every node binds on
    pub port: u16,
    /// Multicast TTL, keep small so datagrams stay on the local network
    pub ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 1, 1, 1),
            port: 5007,
            ttl: 2,
        }
    }
}

impl DiscoveryConfig {
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_discovery_section_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 6000").unwrap();

        let config: DiscoveryConfig = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.group, Ipv4Addr::new(224, 1, 1, 1));
        assert_eq!(config.ttl, 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let res: Result<DiscoveryConfig> = load_config("/nonexistent/cluster.toml");
        assert!(res.is_err());
    }
}
