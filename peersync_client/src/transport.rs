//! Socket transport.
//!
//! The socket lives in its own task. The rest of the client only sees two
//! channels: an unbounded outbound queue of encoded frames (so sending never
//! blocks a tick) and a stream of [`TransportEvent`]s.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peersync_shared::protocol::{encode, Message};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake finished; frames can flow.
    Opened,
    /// One inbound frame, still encoded.
    Frame(Bytes),
    /// Orderly close, from either side.
    Closed { reason: String },
    /// Connect failure or socket error.
    Failed { error: String },
}

/// Both ends of a transport as seen by the connection manager.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens a WebSocket to `url` in a background task.
///
/// Must be called from inside a tokio runtime. Connection errors arrive as
/// [`TransportEvent::Failed`], never as a return value.
pub fn connect_websocket(url: impl Into<String>) -> Link {
    let url = url.into();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_websocket(url, out_rx, ev_tx));
    Link {
        outbound: out_tx,
        events: ev_rx,
    }
}

async fn run_websocket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(%url, error = %e, "WebSocket connect failed");
            let _ = events.send(TransportEvent::Failed {
                error: e.to_string(),
            });
            return;
        }
    };

    info!(%url, "WebSocket open");
    if events.send(TransportEvent::Opened).is_err() {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let end = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let msg = match String::from_utf8(frame.to_vec()) {
                        Ok(text) => WsMessage::text(text),
                        Err(_) => WsMessage::Binary(frame),
                    };
                    if let Err(e) = sink.send(msg).await {
                        break TransportEvent::Failed { error: e.to_string() };
                    }
                }
                None => {
                    // Manager dropped its sender: local close.
                    let _ = sink.close().await;
                    break TransportEvent::Closed { reason: "closed locally".to_string() };
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = Bytes::copy_from_slice(text.as_str().as_bytes());
                    if events.send(TransportEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    if events.send(TransportEvent::Frame(data)).is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_owned())
                        .unwrap_or_default();
                    break TransportEvent::Closed { reason };
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(other)) => debug!(?other, "Ignoring control frame"),
                Some(Err(e)) => break TransportEvent::Failed { error: e.to_string() },
                None => break TransportEvent::Closed { reason: "stream ended".to_string() },
            },
        }
    };

    info!(%url, event = ?end, "WebSocket finished");
    let _ = events.send(end);
}

/// Far end of an in-memory [`Link`].
///
/// Plays the server in unit tests and lets a host feed frames from any
/// other transport it already owns.
pub struct LoopbackPeer {
    sent: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Creates a connected in-memory link.
pub fn loopback() -> (Link, LoopbackPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    (
        Link {
            outbound: out_tx,
            events: ev_rx,
        },
        LoopbackPeer {
            sent: out_rx,
            events: ev_tx,
        },
    )
}

impl LoopbackPeer {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Opened);
    }

    /// Delivers an encoded message to the client.
    pub fn deliver(&self, msg: &Message) -> anyhow::Result<()> {
        let frame = encode(msg)?;
        self.deliver_raw(&frame);
        Ok(())
    }

    /// Delivers arbitrary bytes, valid or not.
    pub fn deliver_raw(&self, frame: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::Frame(Bytes::copy_from_slice(frame)));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    pub fn fail(&self, error: &str) {
        let _ = self.events.send(TransportEvent::Failed {
            error: error.to_string(),
        });
    }

    /// Everything the client has sent so far, decoded. Undecodable frames
    /// are skipped.
    pub fn drain_sent(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            if let Ok(msg) = peersync_shared::protocol::decode(&frame) {
                out.push(msg);
            }
        }
        out
    }

    /// True once the client side dropped its outbound sender. Call after
    /// [`LoopbackPeer::drain_sent`]; a pending frame is discarded.
    pub fn is_closed_by_client(&mut self) -> bool {
        matches!(
            self.sent.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}
