//! Diagnostics for recoverable protocol problems.
//!
//! Dropped frames, rejected sends and unroutable movement never stop the
//! session, but each one is logged, counted and handed to an optional hook
//! so a host can surface it (debug overlay, metrics, test assertions).

use peersync_shared::{error::DecodeError, protocol::ConnectionId};
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;

/// One recoverable event.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// An inbound frame could not be decoded and was dropped.
    FrameDropped { error: DecodeError },
    /// `send` was called while the connection was not open.
    SendRejected {
        kind: &'static str,
        state: ConnectionState,
    },
    /// An outbound message could not be encoded.
    EncodeFailed { kind: &'static str, error: String },
    /// The server offered a second, different identity.
    IdentityReassigned {
        current: ConnectionId,
        offered: ConnectionId,
    },
    /// Movement without a `connectionId`; nothing to apply it to.
    UnroutableMovement,
    /// Movement from a peer nobody announced, under the presence-only policy.
    UnknownPeerMovement { peer: ConnectionId },
    /// The connection reached `Closed`.
    ConnectionLost { reason: String },
}

/// Running totals, one per diagnostic family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub malformed: u64,
    pub unknown_kind: u64,
    pub send_rejected: u64,
    pub encode_failed: u64,
    pub ignored_movement: u64,
    pub identity_conflicts: u64,
    pub connection_lost: u64,
}

pub type DiagnosticHook = Box<dyn FnMut(&Diagnostic) + Send>;

#[derive(Default)]
pub struct Diagnostics {
    counts: DiagnosticCounts,
    hook: Option<DiagnosticHook>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook called for every diagnostic, replacing any previous one.
    pub fn set_hook(&mut self, hook: impl FnMut(&Diagnostic) + Send + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn counts(&self) -> DiagnosticCounts {
        self.counts
    }

    pub fn report(&mut self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::FrameDropped { error } if error.is_unknown_kind() => {
                self.counts.unknown_kind += 1;
                debug!(%error, "Dropping frame");
            }
            Diagnostic::FrameDropped { error } => {
                self.counts.malformed += 1;
                warn!(%error, "Dropping frame");
            }
            Diagnostic::SendRejected { kind, state } => {
                self.counts.send_rejected += 1;
                warn!(kind, ?state, "Send rejected, connection not open");
            }
            Diagnostic::EncodeFailed { kind, error } => {
                self.counts.encode_failed += 1;
                warn!(kind, %error, "Could not encode outbound message");
            }
            Diagnostic::IdentityReassigned { current, offered } => {
                self.counts.identity_conflicts += 1;
                warn!(%current, %offered, "Ignoring second identity assignment");
            }
            Diagnostic::UnroutableMovement => {
                self.counts.ignored_movement += 1;
                debug!("Movement without connection id");
            }
            Diagnostic::UnknownPeerMovement { peer } => {
                self.counts.ignored_movement += 1;
                debug!(%peer, "Movement from unannounced peer");
            }
            Diagnostic::ConnectionLost { reason } => {
                self.counts.connection_lost += 1;
                info!(%reason, "Connection lost");
            }
        }

        if let Some(hook) = self.hook.as_mut() {
            hook(&diagnostic);
        }
    }
}
