//! `peersync_client`
//!
//! Client side of the presence and movement sync protocol:
//! - Socket transport (WebSocket task, or an in-memory loopback)
//! - Connection lifecycle and handshake
//! - Presence tracking of remote peers
//! - Movement replication, both directions
//! - Scene binding trait plus a headless scene for bots and tests

pub mod binding;
pub mod client;
pub mod connection;
pub mod diagnostics;
pub mod input;
pub mod movement;
pub mod presence;
pub mod transport;

pub use binding::{HeadlessScene, SceneBinding};
pub use client::{SessionEnd, SyncClient};
pub use connection::{ConnectionManager, ConnectionState, ProtocolError};
