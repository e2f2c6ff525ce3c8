//! # Common Components
//!
//! Shared utilities and data structures used by both client and server components.
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions for clients, replication and discovery
//! - [`connection`]: TCP connection abstraction with message framing
//! - [`config`]: Configuration parsing utilities
//! - [`logging`]: Logger setup shared by the binaries
//! - [`shutdown`]: Stop flag raced against blocking socket calls

pub mod config;
pub mod connection;
pub mod logging;
pub mod messages;
pub mod shutdown;
