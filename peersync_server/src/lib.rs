//! `peersync_server`
//!
//! Relay for the presence and movement sync protocol:
//! - WebSocket listener, one task per connection
//! - Random connection identities
//! - Roster, join and leave announcements
//! - Movement fan-out, stamped with the sender's identity
//!
//! The relay keeps no game state.

pub mod server;

pub use server::{bind_ephemeral, RelayServer};
