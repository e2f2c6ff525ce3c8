//! # Discovery Bus
//!
//! Fire-and-forget datagrams over a UDP multicast group, or over an
//! in-process [`LoopbackHub`] with the same semantics (used by tests and for
//! running several nodes inside one process).
//!
//! Constructors hand out a `(DiscoveryBus, DiscoveryListener)` pair. The bus is
//! the send side; the listener is a single, non-restartable stream of inbound
//! datagrams owned by whoever consumes it. Payloads that do not decode are
//! dropped and the listener moves on to the next datagram.

use anyhow::Result;
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::common::config::DiscoveryConfig;
use crate::common::messages::DiscoveryMessage;

/// Largest datagram we expect on the control channel.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Capacity of the in-process hub before slow listeners start lagging.
const LOOPBACK_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Datagram {
    payload: Arc<Vec<u8>>,
    source: SocketAddr,
}

/// In-process stand-in for a multicast group.
///
/// Every bus attached to the same hub receives every datagram sent on it,
/// including its own.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<Datagram>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOOPBACK_CAPACITY);
        Self { tx }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

enum Transport {
    Multicast {
        socket: Arc<UdpSocket>,
        group: SocketAddr,
    },
    Loopback {
        hub: broadcast::Sender<Datagram>,
        source: SocketAddr,
    },
}

/// Send side of the discovery channel.
pub struct DiscoveryBus {
    transport: Transport,
}

impl DiscoveryBus {
    /// Join the configured multicast group.
    ///
    /// The socket is bound with address (and, where available, port) reuse so
    /// several nodes on one host can share the group port. Must be called from
    /// inside a tokio runtime.
    pub fn multicast(config: &DiscoveryConfig) -> Result<(DiscoveryBus, DiscoveryListener)> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
        socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;

        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let bus = DiscoveryBus {
            transport: Transport::Multicast {
                socket: socket.clone(),
                group: SocketAddr::V4(config.group_addr()),
            },
        };
        let listener = DiscoveryListener {
            source: Source::Multicast(socket),
        };
        Ok((bus, listener))
    }

    /// Attach to an in-process hub. Datagrams appear to come from `127.0.0.1`.
    pub fn loopback(hub: &LoopbackHub) -> (DiscoveryBus, DiscoveryListener) {
        let bus = DiscoveryBus {
            transport: Transport::Loopback {
                hub: hub.tx.clone(),
                source: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            },
        };
        let listener = DiscoveryListener {
            source: Source::Loopback(hub.tx.subscribe()),
        };
        (bus, listener)
    }

    /// Send a message to every member. No acknowledgment, no retry.
    pub async fn broadcast(&self, message: &DiscoveryMessage) -> Result<()> {
        let payload = message.to_bytes()?;
        match &self.transport {
            Transport::Multicast { socket, group } => {
                socket.send_to(&payload, *group).await?;
            }
            Transport::Loopback { hub, source } => {
                // No subscribers simply means nobody is listening
                let _ = hub.send(Datagram {
                    payload: Arc::new(payload),
                    source: *source,
                });
            }
        }
        Ok(())
    }
}

enum Source {
    Multicast(Arc<UdpSocket>),
    Loopback(broadcast::Receiver<Datagram>),
}

/// Receive side of the discovery channel.
pub struct DiscoveryListener {
    source: Source,
}

impl DiscoveryListener {
    /// Wait for the next well-formed datagram and its sender address.
    ///
    /// Returns `None` only when the underlying channel is gone for good.
    pub async fn next(&mut self) -> Option<(DiscoveryMessage, SocketAddr)> {
        loop {
            let (payload, source) = match &mut self.source {
                Source::Multicast(socket) => {
                    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                    match socket.recv_from(&mut buf).await {
                        Ok((len, source)) => {
                            buf.truncate(len);
                            (buf, source)
                        }
                        Err(e) => {
                            warn!("⚠️  Multicast receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    }
                }
                Source::Loopback(rx) => match rx.recv().await {
                    Ok(datagram) => (datagram.payload.to_vec(), datagram.source),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Discovery listener lagged, {} datagrams lost", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            };

            match DiscoveryMessage::from_bytes(&payload) {
                Ok(message) => return Some((message, source)),
                Err(e) => debug!("Dropping malformed datagram from {}: {}", source, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_to_every_member() {
        let hub = LoopbackHub::new();
        let (bus_a, mut rx_a) = DiscoveryBus::loopback(&hub);
        let (_bus_b, mut rx_b) = DiscoveryBus::loopback(&hub);

        let msg = DiscoveryMessage::Election { node_id: 1 };
        bus_a.broadcast(&msg).await.unwrap();

        let (got_a, _) = rx_a.next().await.unwrap();
        let (got_b, source) = rx_b.next().await.unwrap();
        assert_eq!(got_a, msg);
        assert_eq!(got_b, msg);
        assert_eq!(source.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn malformed_datagrams_are_skipped() {
        let hub = LoopbackHub::new();
        let (bus, mut rx) = DiscoveryBus::loopback(&hub);

        hub.tx
            .send(Datagram {
                payload: Arc::new(b"garbage".to_vec()),
                source: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            })
            .unwrap();
        bus.broadcast(&DiscoveryMessage::ElectionAck { node_id: 9 })
            .await
            .unwrap();

        let (got, _) = rx.next().await.unwrap();
        assert_eq!(got, DiscoveryMessage::ElectionAck { node_id: 9 });
    }
}
