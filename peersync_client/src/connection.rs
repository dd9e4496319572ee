//! Connection manager.
//!
//! Owns the one socket of a session and its lifecycle:
//!
//! ```text
//! Idle --connect()--> Connecting --Opened--> Open --Closed/Failed--> Closed
//!   \_____________________ Closed/Failed / close() ______________________/
//! ```
//!
//! On `Open` it asks for an identity; when the identity arrives it asks for
//! the roster. Every decoded inbound message is republished to all live
//! [`Subscription`]s. Until the identity is known, everything except the
//! identity reply is held back, so consumers never see a message they could
//! not filter against the local identity. `Closed` is terminal, there is no
//! reconnect.

use bytes::Bytes;
use peersync_shared::{
    error::EncodeError,
    protocol::{decode, encode, ConnectionId, Message},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    transport::TransportEvent,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    Idle,
    /// Socket handshake in progress.
    Connecting,
    /// Frames flow both ways.
    Open,
    /// Closed or failed. Terminal.
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot send `{kind}` while the connection is {state:?}")]
    NotConnected {
        kind: &'static str,
        state: ConnectionState,
    },
    #[error("connect() called while the connection is {0:?}")]
    AlreadyStarted(ConnectionState),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("transport queue is gone")]
    Transport,
}

/// Receiving end of the inbound message stream.
///
/// Owned by whichever component consumes messages. Dropping it
/// unsubscribes; the manager forgets it on the next publish.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Everything currently queued, in arrival order.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

pub struct ConnectionManager {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    local_id: Option<ConnectionId>,
    close_reason: Option<String>,
    /// Inbound messages held until the identity is assigned.
    held: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<Message>>,
    diagnostics: Diagnostics,
    frames_sent: u64,
    frames_received: u64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            outbound: None,
            local_id: None,
            close_reason: None,
            held: Vec::new(),
            subscribers: Vec::new(),
            diagnostics: Diagnostics::new(),
            frames_sent: 0,
            frames_received: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Identity assigned by the server, once the handshake got that far.
    pub fn local_identity(&self) -> Option<&ConnectionId> {
        self.local_id.as_ref()
    }

    /// Why the connection reached `Closed`, once it has.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Opens a new inbound message stream.
    pub fn subscribe(&mut self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        Subscription { rx }
    }

    /// Starts the lifecycle with the transport's outbound queue.
    pub fn connect(&mut self, outbound: mpsc::UnboundedSender<Bytes>) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Idle {
            return Err(ProtocolError::AlreadyStarted(self.state));
        }
        self.outbound = Some(outbound);
        self.state = ConnectionState::Connecting;
        debug!("Connecting");
        Ok(())
    }

    /// Feeds one transport event through the state machine.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(frame) => self.on_frame(&frame),
            TransportEvent::Closed { reason } => self.transition_closed(reason),
            TransportEvent::Failed { error } => self.transition_closed(format!("failed: {error}")),
        }
    }

    /// Encodes and queues a message. Never blocks.
    pub fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Open {
            self.diagnostics.report(Diagnostic::SendRejected {
                kind: msg.kind(),
                state: self.state,
            });
            return Err(ProtocolError::NotConnected {
                kind: msg.kind(),
                state: self.state,
            });
        }

        let frame = match encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                self.diagnostics.report(Diagnostic::EncodeFailed {
                    kind: msg.kind(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let queued = self
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !queued {
            self.transition_closed("transport queue is gone".to_string());
            return Err(ProtocolError::Transport);
        }

        self.frames_sent += 1;
        debug!(kind = msg.kind(), "Sent");
        Ok(())
    }

    /// Closes from our side. Dropping the outbound sender tells the socket
    /// task to send a close frame.
    pub fn close(&mut self, reason: &str) {
        self.transition_closed(reason.to_string());
    }

    fn on_opened(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!(state = ?self.state, "Unexpected open notification");
            return;
        }
        self.state = ConnectionState::Open;
        info!("Connection open, requesting identity");
        if let Err(e) = self.send(&Message::IdentityRequest) {
            warn!(error = %e, "Identity request failed");
        }
    }

    fn on_frame(&mut self, frame: &[u8]) {
        if self.state != ConnectionState::Open {
            debug!(state = ?self.state, "Frame outside open state, dropped");
            return;
        }
        self.frames_received += 1;

        let msg = match decode(frame) {
            Ok(msg) => msg,
            Err(error) => {
                self.diagnostics.report(Diagnostic::FrameDropped { error });
                return;
            }
        };

        if let Message::IdentityAssigned(id) = &msg {
            let id = id.clone();
            self.publish(msg);
            self.on_identity(id);
            return;
        }
        if self.local_id.is_none() {
            debug!(kind = msg.kind(), "Holding message until identity is assigned");
            self.held.push(msg);
            return;
        }
        self.publish(msg);
    }

    fn on_identity(&mut self, id: ConnectionId) {
        match &self.local_id {
            None => {
                info!(connection_id = %id, "Identity assigned, requesting roster");
                self.local_id = Some(id);
                if let Err(e) = self.send(&Message::RosterRequest) {
                    warn!(error = %e, "Roster request failed");
                }
                for msg in std::mem::take(&mut self.held) {
                    self.publish(msg);
                }
            }
            Some(current) if *current == id => {
                debug!(connection_id = %id, "Identity repeated");
            }
            Some(current) => {
                let current = current.clone();
                self.diagnostics.report(Diagnostic::IdentityReassigned {
                    current,
                    offered: id,
                });
            }
        }
    }

    fn publish(&mut self, msg: Message) {
        self.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    fn transition_closed(&mut self, reason: String) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.outbound = None;
        self.close_reason = Some(reason.clone());
        if !self.held.is_empty() {
            debug!(count = self.held.len(), "Discarding messages held for identity");
            self.held.clear();
        }
        self.diagnostics
            .report(Diagnostic::ConnectionLost { reason });
    }
}
