//! `peersync_shared`
//!
//! Pieces used by both the client and the relay server.
//!
//! Design goals:
//! - One place that defines what goes over the wire.
//! - Decoding never panics; every failure is a typed, recoverable error.
//! - Optional fields stay optional all the way through (`Option`, never a
//!   zero/idle default).
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod math;
pub mod protocol;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::protocol::*;
}
