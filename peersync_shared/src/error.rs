//! Error taxonomy for the sync protocol.
//!
//! Decode and protocol errors are always recoverable: callers log them and
//! keep going. Transport failures are not errors here; they show up as a
//! state transition on the connection.

use thiserror::Error;

/// Why an inbound frame could not be turned into a [`crate::protocol::Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not valid JSON, not an envelope, or a known kind whose payload is
    /// structurally invalid.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed envelope carrying an action this build does not know.
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
}

impl DecodeError {
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, DecodeError::UnknownKind(_))
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// Why an outbound message could not be serialized.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// JSON has no NaN/inf; serde_json writes them as `null`, which the
    /// receiver reads as a missing position or an unchanged velocity.
    #[error("movement field `{field}` must be finite, got {value}")]
    NonFinite { field: &'static str, value: f32 },
    #[error("serialize frame: {0}")]
    Json(#[from] serde_json::Error),
}
