//! # Message Protocol
//!
//! Defines every message exchanged in the cluster:
//! - Client sessions (TCP, see [`ClientRequest`] / [`ServerMessage`])
//! - Primary -> backup replication (TCP, see [`ReplicationMessage`])
//! - Peer discovery, heartbeats and elections (UDP multicast, see [`DiscoveryMessage`])
//!
//! All messages are JSON objects with a `type` tag, e.g.
//! `{"type":"MOVE","r":0,"c":2,"val":3}`.

use serde::{Deserialize, Serialize};

use crate::game::{GameState, MoveRejection};

// ============================================================================
// CLIENT <-> SERVER
// ============================================================================

/// Messages sent by a client over its session connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRequest {
    /// First message of a session. A missing name plays as `"anon"`.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Ask for the current snapshot.
    GetState,

    /// Try to write `val` into cell `(r, c)`.
    Move { r: i64, c: i64, val: i64 },
}

/// Tag attached to the initial snapshot of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionNote {
    /// Served by the primary, moves are accepted
    Primary,
    /// Served by a backup that knows no primary, read-only
    Spectator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveResult {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A move reached a node that does not hold the primary role
    NotPrimary,
    /// The request could not be decoded or is not valid at this point
    Unknown,
}

/// Messages sent by a server over a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Go talk to the primary instead. The server closes the connection next.
    Redirect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Full snapshot of the game.
    State {
        state: GameState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<SessionNote>,
    },

    /// Answer to a move, always carrying the snapshot taken right after it.
    MoveAck {
        result: MoveResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<MoveRejection>,
        state: GameState,
    },

    Error { error: ErrorCode },
}

// ============================================================================
// REPLICATION (primary -> backup)
// ============================================================================

/// Messages on a replication link.
///
/// The backup opens the link and sends [`ReplicationMessage::Hello`] exactly
/// once; after that only the primary writes, one
/// [`ReplicationMessage::StateUpdate`] per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMessage {
    #[serde(rename = "REPL_HELLO")]
    Hello { node_id: u32 },

    StateUpdate { state: GameState },
}

// ============================================================================
// DISCOVERY (UDP multicast)
// ============================================================================

/// Control datagrams on the multicast group.
///
/// Delivery is unordered and may drop or duplicate, so every handler must be
/// safe to apply more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMessage {
    /// Sent once when a node starts.
    Hello {
        node_id: u32,
        tcp_port: u16,
        replication_port: u16,
    },

    /// "I am the primary, clients and backups should connect here."
    #[serde(rename = "PRIMARY")]
    PrimaryAnnounce {
        node_id: u32,
        tcp_port: u16,
        replication_port: u16,
    },

    /// Periodic liveness beacon.
    Heartbeat {
        node_id: u32,
        tcp_port: u16,
        replication_port: u16,
    },

    /// Sent by a node that found no primary after waiting.
    Election { node_id: u32 },

    /// Reply from a node with a greater id than the election's sender.
    #[serde(rename = "ELECTION_OK")]
    ElectionAck { node_id: u32 },
}

impl DiscoveryMessage {
    /// Id of the node that sent this datagram.
    pub fn node_id(&self) -> u32 {
        match self {
            DiscoveryMessage::Hello { node_id, .. }
            | DiscoveryMessage::PrimaryAnnounce { node_id, .. }
            | DiscoveryMessage::Heartbeat { node_id, .. }
            | DiscoveryMessage::Election { node_id }
            | DiscoveryMessage::ElectionAck { node_id } => *node_id,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
