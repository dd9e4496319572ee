//! Relay server.
//!
//! A minimal server for the sync protocol. It has no game state and
//! decides nothing:
//! - assigns each WebSocket connection a random identity;
//! - answers identity and roster requests;
//! - announces joins and leaves to everyone else;
//! - stamps movement with the sender's identity and fans it out.
//!
//! One hub task owns the connection table. Per-connection tasks only move
//! frames between their socket and the hub, so no lock is ever taken.

use std::{collections::BTreeMap, net::SocketAddr};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peersync_shared::{
    config::SyncConfig,
    protocol::{decode, encode, ConnectionId, Message},
};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

const ID_LEN: usize = 12;

/// What connection tasks tell the hub.
#[derive(Debug)]
enum HubEvent {
    Connected {
        outbound: mpsc::UnboundedSender<Bytes>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Frame {
        from: ConnectionId,
        frame: Bytes,
    },
    Disconnected {
        id: ConnectionId,
    },
}

/// Connection table plus routing rules.
#[derive(Default)]
struct Hub {
    peers: BTreeMap<ConnectionId, mpsc::UnboundedSender<Bytes>>,
}

impl Hub {
    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { outbound, reply } => {
                let id = self.fresh_id();
                if reply.send(id.clone()).is_err() {
                    return;
                }
                self.peers.insert(id.clone(), outbound);
                info!(connection_id = %id, peers = self.peers.len(), "Client connected");
                self.broadcast_except(&id, &Message::Joined(id.clone()));
            }
            HubEvent::Frame { from, frame } => match decode(&frame) {
                Ok(msg) => self.on_message(&from, msg),
                Err(error) => debug!(connection_id = %from, %error, "Dropping frame"),
            },
            HubEvent::Disconnected { id } => {
                if self.peers.remove(&id).is_some() {
                    info!(connection_id = %id, peers = self.peers.len(), "Client disconnected");
                    self.broadcast_except(&id, &Message::Left(id.clone()));
                }
            }
        }
    }

    fn on_message(&mut self, from: &ConnectionId, msg: Message) {
        match msg {
            Message::IdentityRequest => {
                self.send_to(from, &Message::IdentityAssigned(from.clone()));
            }
            Message::RosterRequest => {
                let roster = self.peers.keys().cloned().collect();
                self.send_to(from, &Message::RosterSnapshot(roster));
            }
            Message::Movement(mut data) => {
                // Clients cannot speak for each other.
                data.connection_id = Some(from.clone());
                self.broadcast_except(from, &Message::Movement(data));
            }
            other => debug!(connection_id = %from, kind = other.kind(), "Ignoring client message"),
        }
    }

    fn fresh_id(&self) -> ConnectionId {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ID_LEN)
                .map(char::from)
                .collect();
            let id = ConnectionId::new(id);
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
    }

    fn send_to(&self, to: &ConnectionId, msg: &Message) {
        let Some(tx) = self.peers.get(to) else {
            return;
        };
        match encode(msg) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(error) => warn!(%error, kind = msg.kind(), "Could not encode"),
        }
    }

    fn broadcast_except(&self, except: &ConnectionId, msg: &Message) {
        let frame = match encode(msg) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, kind = msg.kind(), "Could not encode");
                return;
            }
        };
        for (id, tx) in &self.peers {
            if id != except {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

/// Bound relay, not yet accepting.
pub struct RelayServer {
    listener: TcpListener,
}

impl RelayServer {
    /// Binds `cfg.listen_addr`.
    pub async fn bind(cfg: SyncConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut hub = Hub::default();
            while let Some(event) = hub_rx.recv().await {
                hub.handle(event);
            }
        });

        info!(addr = %self.local_addr()?, "Relay listening");
        loop {
            let (stream, addr) = self.listener.accept().await.context("accept")?;
            let hub = hub_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, addr, hub).await {
                    warn!(%addr, error = %e, "Connection ended with error");
                }
            });
        }
    }

    /// Runs the relay in a background task.
    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run())
    }
}

/// Binds a relay on a free loopback port. The returned config points
/// `server_url` at it.
pub async fn bind_ephemeral() -> anyhow::Result<(RelayServer, SyncConfig)> {
    let cfg = SyncConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..SyncConfig::default()
    };
    let server = RelayServer::bind(cfg.clone()).await?;
    let addr = server.local_addr()?;
    let client_cfg = SyncConfig {
        server_url: format!("ws://{addr}"),
        listen_addr: addr.to_string(),
        ..cfg
    };
    Ok((server, client_cfg))
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: mpsc::UnboundedSender<HubEvent>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut sink, mut incoming) = ws.split();

    let (outbound, mut frames) = mpsc::unbounded_channel();
    let (reply, assigned) = oneshot::channel();
    hub.send(HubEvent::Connected { outbound, reply })
        .map_err(|_| anyhow!("hub stopped"))?;
    let id = assigned.await.context("hub stopped")?;
    debug!(%addr, connection_id = %id, "Socket bound to identity");

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let text = match String::from_utf8(frame.to_vec()) {
                        Ok(text) => text,
                        Err(e) => break Err(anyhow::Error::new(e).context("frame is not utf-8")),
                    };
                    if let Err(e) = sink.send(WsMessage::text(text)).await {
                        break Err(anyhow::Error::new(e).context("send"));
                    }
                }
                None => break Ok(()),
            },
            msg = incoming.next() => {
                let frame = match msg {
                    Some(Ok(WsMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => data,
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(anyhow::Error::new(e).context("receive")),
                };
                if hub.send(HubEvent::Frame { from: id.clone(), frame }).is_err() {
                    break Ok(());
                }
            },
        }
    };

    let _ = hub.send(HubEvent::Disconnected { id });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_shared::{math::Vec2, protocol::MovementData};

    fn connect(hub: &mut Hub) -> (ConnectionId, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (reply, mut assigned) = oneshot::channel();
        hub.handle(HubEvent::Connected { outbound, reply });
        (assigned.try_recv().unwrap(), rx)
    }

    fn recv_all(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame).unwrap());
        }
        out
    }

    fn send(hub: &mut Hub, from: &ConnectionId, msg: &Message) {
        hub.handle(HubEvent::Frame {
            from: from.clone(),
            frame: encode(msg).unwrap(),
        });
    }

    #[test]
    fn identities_are_unique() {
        let mut hub = Hub::default();
        let (a, _ra) = connect(&mut hub);
        let (b, _rb) = connect(&mut hub);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), ID_LEN);
    }

    #[test]
    fn join_is_announced_to_others_only() {
        let mut hub = Hub::default();
        let (_a, mut ra) = connect(&mut hub);
        let (b, mut rb) = connect(&mut hub);
        assert_eq!(recv_all(&mut ra), vec![Message::Joined(b)]);
        assert!(recv_all(&mut rb).is_empty());
    }

    #[test]
    fn identity_and_roster_requests_are_answered() {
        let mut hub = Hub::default();
        let (a, mut ra) = connect(&mut hub);
        let (b, _rb) = connect(&mut hub);
        recv_all(&mut ra);

        send(&mut hub, &a, &Message::IdentityRequest);
        send(&mut hub, &a, &Message::RosterRequest);

        assert_eq!(
            recv_all(&mut ra),
            vec![
                Message::IdentityAssigned(a.clone()),
                Message::RosterSnapshot([a, b].into_iter().collect()),
            ]
        );
    }

    #[test]
    fn movement_is_stamped_and_not_echoed() {
        let mut hub = Hub::default();
        let (a, mut ra) = connect(&mut hub);
        let (_b, mut rb) = connect(&mut hub);
        recv_all(&mut ra);

        let forged = MovementData::at(Vec2::new(3.0, 4.0)).from_peer("someone-else".into());
        send(&mut hub, &a, &Message::Movement(forged));

        assert!(recv_all(&mut ra).is_empty());
        assert_eq!(
            recv_all(&mut rb),
            vec![Message::Movement(
                MovementData::at(Vec2::new(3.0, 4.0)).from_peer(a)
            )]
        );
    }

    #[test]
    fn disconnect_announces_leave_once() {
        let mut hub = Hub::default();
        let (a, _ra) = connect(&mut hub);
        let (_b, mut rb) = connect(&mut hub);

        hub.handle(HubEvent::Disconnected { id: a.clone() });
        hub.handle(HubEvent::Disconnected { id: a.clone() });
        assert_eq!(recv_all(&mut rb), vec![Message::Left(a)]);
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let mut hub = Hub::default();
        let (a, mut ra) = connect(&mut hub);
        hub.handle(HubEvent::Frame {
            from: a,
            frame: Bytes::from_static(b"\x00\x01 nope"),
        });
        assert!(recv_all(&mut ra).is_empty());
        assert_eq!(hub.peers.len(), 1);
    }
}
