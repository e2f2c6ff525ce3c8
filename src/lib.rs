pub mod client;
pub mod common;
pub mod discovery;
pub mod game;
pub mod server;

pub use common::messages::{ClientRequest, DiscoveryMessage, ReplicationMessage, ServerMessage};
pub use game::GameState;
pub use server::{ServerConfig, ServerCore, ServerMiddleware};
