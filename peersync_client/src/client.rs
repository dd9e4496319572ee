//! Client session.
//!
//! [`SyncClient`] wires one connection to one scene:
//! - the [`ConnectionManager`] runs the handshake and decodes frames;
//! - decoded messages are routed to presence or movement;
//! - every tick, local input goes to the local actor and, when it changed,
//!   out to the server.
//!
//! The session ends when the connection closes or the console says `quit`.

use std::time::Duration;

use peersync_shared::{
    config::SyncConfig,
    protocol::{action, ConnectionId, Facing, Message},
};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{
    binding::{EntityHandle, SceneBinding},
    connection::{ConnectionManager, ConnectionState, ProtocolError, Subscription},
    diagnostics::{Diagnostic, DiagnosticCounts},
    movement::{MovementSynchronizer, RemoteOutcome},
    presence::PresenceTracker,
    transport::{self, Link, TransportEvent},
};

/// Why [`SyncClient::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    ConnectionLost { reason: String },
    Quit,
}

pub struct SyncClient<B: SceneBinding> {
    cfg: SyncConfig,
    connection: ConnectionManager,
    inbox: Subscription,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    presence: PresenceTracker,
    movement: MovementSynchronizer,
    binding: B,
    local_actor: EntityHandle,
    /// Pose last started on the local actor.
    local_pose: Option<Facing>,
    tick: u64,
    messages_sent: u64,
}

impl<B: SceneBinding> SyncClient<B> {
    /// Builds a session over an existing link and spawns the local actor.
    pub fn new(cfg: SyncConfig, mut binding: B, link: Link) -> Result<Self, ProtocolError> {
        let mut connection = ConnectionManager::new();
        let inbox = connection.subscribe();
        connection.connect(link.outbound)?;

        let local_actor = binding.create_local_actor(cfg.spawn);
        let presence = PresenceTracker::new(cfg.spawn);
        let movement = MovementSynchronizer::new(&cfg);

        Ok(Self {
            cfg,
            connection,
            inbox,
            events: link.events,
            presence,
            movement,
            binding,
            local_actor,
            local_pose: None,
            tick: 0,
            messages_sent: 0,
        })
    }

    /// Opens a WebSocket to `cfg.server_url`. Needs a tokio runtime.
    pub fn connect_websocket(cfg: SyncConfig, binding: B) -> Result<Self, ProtocolError> {
        info!(url = %cfg.server_url, "Connecting to server");
        let link = transport::connect_websocket(cfg.server_url.clone());
        Self::new(cfg, binding, link)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn local_identity(&self) -> Option<&ConnectionId> {
        self.connection.local_identity()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    pub fn binding_mut(&mut self) -> &mut B {
        &mut self.binding
    }

    pub fn local_actor(&self) -> EntityHandle {
        self.local_actor
    }

    /// Movement frames queued by [`SyncClient::tick`].
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn diagnostics(&self) -> DiagnosticCounts {
        self.connection.diagnostics().counts()
    }

    pub fn set_diagnostic_hook(&mut self, hook: impl FnMut(&Diagnostic) + Send + 'static) {
        self.connection.diagnostics_mut().set_hook(hook);
    }

    /// Handles every transport event already queued. Never waits.
    /// Returns how many events were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Waits for one transport event and handles it. `false` once the
    /// transport is gone.
    pub async fn step(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => {
                self.connection.close("transport task ended");
                false
            }
        }
    }

    /// Feeds one event to the connection, then routes whatever it decoded.
    pub fn handle_event(&mut self, event: TransportEvent) {
        self.connection.handle_event(event);
        for msg in self.inbox.drain() {
            self.dispatch(msg);
        }
    }

    /// Routes one decoded message.
    pub fn dispatch(&mut self, msg: Message) {
        let local = self.connection.local_identity();
        match msg {
            Message::RosterSnapshot(ids) => {
                self.presence.on_roster(&ids, local, &mut self.binding);
            }
            Message::Joined(id) => {
                self.presence.on_joined(&id, local, &mut self.binding);
            }
            Message::Left(id) => {
                self.presence.on_left(&id, local, &mut self.binding);
            }
            Message::Movement(data) => {
                let outcome = self.movement.on_remote_movement(
                    &data,
                    local,
                    &mut self.presence,
                    &mut self.binding,
                );
                let diagnostic = match outcome {
                    RemoteOutcome::Unroutable => Some(Diagnostic::UnroutableMovement),
                    RemoteOutcome::UnknownPeer => data
                        .connection_id
                        .map(|peer| Diagnostic::UnknownPeerMovement { peer }),
                    RemoteOutcome::Applied | RemoteOutcome::Spawned | RemoteOutcome::SelfEcho => {
                        None
                    }
                };
                if let Some(diagnostic) = diagnostic {
                    self.connection.diagnostics_mut().report(diagnostic);
                }
            }
            // Handshake traffic; the connection manager already acted on it.
            Message::IdentityAssigned(_) | Message::IdentityRequest | Message::RosterRequest => {}
        }
    }

    /// One simulation tick: sample input, drive the local actor, replicate.
    /// Returns how many frames were queued.
    pub fn tick(&mut self) -> usize {
        self.tick += 1;
        self.binding.advance(self.tick_seconds());
        let sample = self.binding.sample_local_input();

        // The local actor reacts immediately; the network only hears changes.
        let vx = self.cfg.walk_velocity(sample.horizontal);
        self.binding
            .set_velocity(self.local_actor, Some(vx), sample.vertical_impulse);
        if self.local_pose != Some(sample.horizontal) {
            self.local_pose = Some(sample.horizontal);
            self.binding.play_pose(
                self.local_actor,
                sample.horizontal,
                sample.horizontal.is_walking(),
            );
        }

        if !self.connection.is_open() {
            // Facing changes are picked up once open; a jump is gone for good.
            if sample.vertical_impulse.is_some() {
                let state = self.connection.state();
                self.connection
                    .diagnostics_mut()
                    .report(Diagnostic::SendRejected {
                        kind: action::MOVEMENT,
                        state,
                    });
            }
            return 0;
        }

        let position = self.binding.current_position(self.local_actor);
        let outgoing = self.movement.on_local_input_sample(
            &sample,
            position,
            self.connection.local_identity(),
        );

        let mut queued = 0;
        for msg in &outgoing {
            match self.connection.send(msg) {
                Ok(()) => queued += 1,
                Err(e) => debug!(tick = self.tick, error = %e, "Movement not sent"),
            }
        }
        self.messages_sent += queued as u64;
        queued
    }

    /// Runs until the connection closes or `quit` arrives on `console`.
    ///
    /// Ticks at `tick_hz`. Console replies go to stdout.
    pub async fn run(&mut self, mut console: Option<mpsc::Receiver<String>>) -> SessionEnd {
        let period = Duration::from_secs_f32(self.tick_seconds());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.connection.state() == ConnectionState::Closed {
                let reason = self
                    .connection
                    .close_reason()
                    .unwrap_or("closed")
                    .to_string();
                self.teardown();
                return SessionEnd::ConnectionLost { reason };
            }

            tokio::select! {
                alive = self.step() => {
                    if !alive {
                        debug!("Transport task ended");
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
                line = next_line(&mut console) => match line {
                    Some(line) if is_quit(&line) => {
                        self.shutdown("quit");
                        return SessionEnd::Quit;
                    }
                    Some(line) => {
                        for reply in self.exec_console(&line) {
                            println!("{reply}");
                        }
                    }
                    None => console = None,
                },
            }
        }
    }

    fn tick_seconds(&self) -> f32 {
        1.0 / self.cfg.tick_hz.max(1) as f32
    }

    /// Executes a console command and returns the lines to show.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Vec::new();
        };

        match *command {
            "status" => {
                let counts = self.diagnostics();
                vec![
                    format!("State: {:?}", self.state()),
                    format!(
                        "Connection ID: {}",
                        self.local_identity()
                            .map(ConnectionId::as_str)
                            .unwrap_or("(unassigned)")
                    ),
                    format!("Tick: {}", self.tick),
                    format!("Peers: {}", self.presence.len()),
                    format!("Facing: {}", self.movement.last_facing()),
                    format!(
                        "Frames: {} sent, {} received, {} movement",
                        self.connection.frames_sent(),
                        self.connection.frames_received(),
                        self.messages_sent
                    ),
                    format!(
                        "Dropped: {} malformed, {} unknown, {} ignored movement",
                        counts.malformed, counts.unknown_kind, counts.ignored_movement
                    ),
                ]
            }
            "peers" => {
                if self.presence.is_empty() {
                    return vec!["No peers".to_string()];
                }
                self.presence
                    .iter()
                    .map(|p| {
                        let facing = p
                            .facing
                            .map(|f| f.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        format!(
                            "{} at ({:.1}, {:.1}) facing {}",
                            p.connection_id, p.position.x, p.position.y, facing
                        )
                    })
                    .collect()
            }
            "help" => vec!["Commands: status, peers, quit".to_string()],
            other => vec![format!("Unknown command: {other}")],
        }
    }

    /// Closes the connection and removes every peer actor.
    pub fn shutdown(&mut self, reason: &str) {
        self.connection.close(reason);
        self.teardown();
    }

    fn teardown(&mut self) {
        let removed = self.presence.teardown(&mut self.binding);
        info!(removed, "Session over");
    }
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim(), "quit" | "exit")
}

async fn next_line(console: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match console {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::HeadlessScene,
        input::InputSample,
        transport::{loopback, LoopbackPeer},
    };
    use peersync_shared::{
        config::SpawnPolicy,
        math::Vec2,
        protocol::{Facing, MovementData},
    };

    fn session(cfg: SyncConfig) -> (SyncClient<HeadlessScene>, LoopbackPeer) {
        let (link, peer) = loopback();
        let client = SyncClient::new(cfg, HeadlessScene::new(), link).unwrap();
        (client, peer)
    }

    /// Opens the session and assigns `id`; clears the handshake frames.
    fn joined_as(id: &str) -> (SyncClient<HeadlessScene>, LoopbackPeer) {
        joined_with(SyncConfig::default(), id)
    }

    fn joined_with(cfg: SyncConfig, id: &str) -> (SyncClient<HeadlessScene>, LoopbackPeer) {
        let (mut client, mut peer) = session(cfg);
        peer.open();
        peer.deliver(&Message::IdentityAssigned(id.into())).unwrap();
        client.pump();
        peer.drain_sent();
        (client, peer)
    }

    #[test]
    fn handshake_then_roster_populates_peers() {
        let (mut client, mut peer) = session(SyncConfig::default());
        peer.open();
        client.pump();
        assert_eq!(peer.drain_sent(), vec![Message::IdentityRequest]);

        peer.deliver(&Message::IdentityAssigned("abc".into())).unwrap();
        client.pump();
        assert_eq!(peer.drain_sent(), vec![Message::RosterRequest]);

        peer.deliver(&Message::RosterSnapshot(
            ["abc", "xyz"].into_iter().map(ConnectionId::from).collect(),
        ))
        .unwrap();
        client.pump();

        assert_eq!(client.presence().len(), 1);
        assert!(client.presence().contains(&"xyz".into()));
        assert!(!client.presence().contains(&"abc".into()));
        assert_eq!(client.binding().peer_count(), 1);
    }

    #[test]
    fn ticks_replicate_direction_changes_only() {
        let (mut client, mut peer) = joined_as("me");
        for facing in [Facing::Idle, Facing::Left, Facing::Left, Facing::Right] {
            client.binding_mut().push_input(InputSample::walking(facing));
            client.tick();
        }

        let sent = peer.drain_sent();
        assert_eq!(client.messages_sent(), 2);
        let frames: Vec<&MovementData> = sent
            .iter()
            .map(|msg| match msg {
                Message::Movement(d) => d,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|d| d.connection_id == Some("me".into()) && d.y == 450.0));
        // Left goes out from the spawn point; by the turn the actor has walked.
        assert_eq!(frames[0].x, 100.0);
        assert!(frames[1].x < 100.0);
    }

    #[test]
    fn frames_carry_the_actor_position_at_send_time() {
        let (mut client, mut peer) = joined_as("me");
        let local = client.local_actor();
        client.binding_mut().teleport(local, Vec2::new(300.0, 200.0));
        client
            .binding_mut()
            .push_input(InputSample::idle().with_jump(-330.0));
        assert_eq!(client.tick(), 1);

        assert_eq!(
            peer.drain_sent(),
            vec![Message::Movement(
                MovementData::at(Vec2::new(300.0, 200.0))
                    .with_velocity_y(-330.0)
                    .from_peer("me".into())
            )]
        );
    }

    #[test]
    fn local_pose_starts_once_per_change_even_when_closed() {
        let (mut client, peer) = joined_as("me");
        peer.close("gone");
        client.pump();
        assert_eq!(client.state(), ConnectionState::Closed);

        for facing in [Facing::Idle, Facing::Idle, Facing::Left, Facing::Left] {
            client.binding_mut().push_input(InputSample::walking(facing));
            client.tick();
        }
        let actor = client.binding().actor(client.local_actor()).unwrap();
        assert_eq!(actor.pose, Some((Facing::Left, true)));
        assert_eq!(actor.pose_plays, 2);
    }

    #[test]
    fn jump_before_open_is_reported() {
        let (mut client, _peer) = session(SyncConfig::default());
        client
            .binding_mut()
            .push_input(InputSample::idle().with_jump(-330.0));
        client.binding_mut().push_input(InputSample::walking(Facing::Right));
        client.tick();
        client.tick();
        // Only the jump is lost; the facing goes out once open.
        assert_eq!(client.diagnostics().send_rejected, 1);
    }

    #[test]
    fn announcements_before_identity_never_create_self() {
        let (mut client, peer) = session(SyncConfig::default());
        peer.open();
        peer.deliver(&Message::Joined("me".into())).unwrap();
        peer.deliver(&Message::Joined("xyz".into())).unwrap();
        peer.deliver(&Message::IdentityAssigned("me".into())).unwrap();
        client.pump();

        assert_eq!(client.local_identity().map(ConnectionId::as_str), Some("me"));
        assert!(!client.presence().contains(&"me".into()));
        assert!(client.presence().contains(&"xyz".into()));
        assert_eq!(client.binding().peer_creates(), 1);
    }

    #[test]
    fn local_actor_follows_input_without_waiting_for_network() {
        let (mut client, _peer) = session(SyncConfig::default());
        client
            .binding_mut()
            .push_input(InputSample::walking(Facing::Left).with_jump(-330.0));
        assert_eq!(client.tick(), 0);

        let actor = client.binding().actor(client.local_actor()).unwrap();
        assert_eq!(actor.velocity_x, Some(-160.0));
        assert_eq!(actor.velocity_y, Some(-330.0));
        assert_eq!(actor.pose, Some((Facing::Left, true)));
    }

    #[test]
    fn facing_change_before_open_is_sent_once_open() {
        let (mut client, mut peer) = session(SyncConfig::default());
        client.binding_mut().push_input(InputSample::walking(Facing::Right));
        client.tick();

        peer.open();
        peer.deliver(&Message::IdentityAssigned("me".into())).unwrap();
        client.pump();
        peer.drain_sent();

        client.binding_mut().push_input(InputSample::walking(Facing::Right));
        assert_eq!(client.tick(), 1);
        assert_eq!(client.diagnostics().send_rejected, 0);
    }

    #[test]
    fn remote_movement_spawns_and_updates_peer() {
        let (mut client, peer) = joined_as("me");
        peer.deliver(&Message::Movement(
            MovementData::at(Vec2::new(10.0, 20.0)).from_peer("xyz".into()),
        ))
        .unwrap();
        peer.deliver(&Message::Movement(
            MovementData::at(Vec2::new(15.0, 20.0))
                .with_velocity_x(160.0)
                .from_peer("xyz".into()),
        ))
        .unwrap();
        client.pump();

        let p = client.presence().get(&"xyz".into()).unwrap();
        assert_eq!(p.position, Vec2::new(15.0, 20.0));
        assert_eq!(p.velocity_x, Some(160.0));
        assert_eq!(client.binding().peer_creates(), 1);
    }

    #[test]
    fn presence_only_counts_unannounced_movement() {
        let (mut client, peer) = joined_with(
            SyncConfig {
                spawn_policy: SpawnPolicy::PresenceOnly,
                ..SyncConfig::default()
            },
            "me",
        );
        peer.deliver(&Message::Movement(
            MovementData::at(Vec2::new(1.0, 1.0)).from_peer("xyz".into()),
        ))
        .unwrap();
        peer.deliver(&Message::Movement(MovementData::at(Vec2::new(1.0, 1.0))))
            .unwrap();
        client.pump();

        assert!(client.presence().is_empty());
        assert_eq!(client.diagnostics().ignored_movement, 2);
    }

    #[test]
    fn leave_destroys_peer_actor() {
        let (mut client, peer) = joined_as("me");
        peer.deliver(&Message::Joined("xyz".into())).unwrap();
        peer.deliver(&Message::Left("xyz".into())).unwrap();
        client.pump();
        assert!(client.presence().is_empty());
        assert_eq!(client.binding().peer_destroys(), 1);
    }

    #[test]
    fn console_reports_status_and_peers() {
        let (mut client, peer) = joined_as("me");
        assert_eq!(client.exec_console("peers"), vec!["No peers".to_string()]);

        peer.deliver(&Message::Joined("xyz".into())).unwrap();
        client.pump();

        let status = client.exec_console("status");
        assert!(status.iter().any(|l| l == "Connection ID: me"));
        assert!(status.iter().any(|l| l == "Peers: 1"));
        assert_eq!(
            client.exec_console("peers"),
            vec!["xyz at (100.0, 450.0) facing -".to_string()]
        );
        assert!(client.exec_console("").is_empty());
        assert_eq!(
            client.exec_console("dance"),
            vec!["Unknown command: dance".to_string()]
        );
    }

    #[test]
    fn shutdown_clears_scene_and_closes() {
        let (mut client, mut peer) = joined_as("me");
        peer.deliver(&Message::Joined("a".into())).unwrap();
        peer.deliver(&Message::Joined("b".into())).unwrap();
        client.pump();

        client.shutdown("scene exit");
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.binding().peer_count(), 0);
        assert!(peer.is_closed_by_client());
    }

    #[tokio::test]
    async fn run_ends_when_server_closes() {
        let (mut client, peer) = joined_as("me");
        peer.deliver(&Message::Joined("xyz".into())).unwrap();
        peer.close("server shutting down");

        let end = tokio::time::timeout(Duration::from_secs(5), client.run(None))
            .await
            .unwrap();
        assert_eq!(
            end,
            SessionEnd::ConnectionLost {
                reason: "server shutting down".to_string()
            }
        );
        assert!(client.presence().is_empty());
    }

    #[tokio::test]
    async fn run_quits_on_console_command() {
        let (mut client, _peer) = joined_as("me");
        let (tx, rx) = mpsc::channel(4);
        tx.send("quit".to_string()).await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), client.run(Some(rx)))
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Quit);
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
