//! # Peer Discovery
//!
//! Unreliable broadcast of [`DiscoveryMessage`](crate::common::messages::DiscoveryMessage)
//! datagrams to every node of the cluster. Servers use it for hellos,
//! heartbeats and elections; the terminal client listens on it to find the
//! current primary.

pub mod bus;

pub use bus::{DiscoveryBus, DiscoveryListener, LoopbackHub};
