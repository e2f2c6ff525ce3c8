//! # Client Components
//!
//! The terminal client is split like the server:
//!
//! ## Core Client ([`client`])
//! Opens a session against one server and reports whether it was served or
//! redirected.
//!
//! ## Client Middleware ([`middleware`])
//! - Primary discovery over multicast
//! - Redirect following
//! - The interactive command loop
//!
//! ## Terminal ([`terminal`])
//! Command parsing and board rendering.

pub mod client;
pub mod middleware;
pub mod terminal;

pub use client::{ClientCore, JoinOutcome};
pub use middleware::ClientMiddleware;
