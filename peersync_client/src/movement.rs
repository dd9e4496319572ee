//! Movement replication.
//!
//! Local half: turns per-tick input into `movement` frames, but only when the
//! facing changes (plus one frame per jump). That bounds outbound traffic to
//! direction changes and discrete events instead of one frame per tick.
//!
//! Remote half: applies incoming `movement` frames to peer actors. Position is
//! always applied; velocity axes and facing only when present.

use peersync_shared::{
    config::{SpawnPolicy, SyncConfig},
    math::Vec2,
    protocol::{ConnectionId, Facing, Message, MovementData},
};
use tracing::trace;

use crate::{
    binding::SceneBinding,
    input::InputSample,
    presence::{is_self, PresenceTracker},
};

/// What happened to one inbound movement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied to a tracked peer.
    Applied,
    /// Peer was unknown and got spawned at the frame's position.
    Spawned,
    /// Our own movement echoed back.
    SelfEcho,
    /// No `connectionId` on the frame.
    Unroutable,
    /// Unknown peer and the policy forbids spawning from movement.
    UnknownPeer,
}

pub struct MovementSynchronizer {
    last_facing: Facing,
    walk_speed: f32,
    policy: SpawnPolicy,
}

impl MovementSynchronizer {
    pub fn new(cfg: &SyncConfig) -> Self {
        Self {
            last_facing: Facing::Idle,
            walk_speed: cfg.walk_speed,
            policy: cfg.spawn_policy,
        }
    }

    /// Facing most recently broadcast.
    pub fn last_facing(&self) -> Facing {
        self.last_facing
    }

    /// Builds the frames to send for one input sample.
    ///
    /// At most one horizontal frame (only on a facing change) and one
    /// vertical frame (whenever a jump happens).
    pub fn on_local_input_sample(
        &mut self,
        sample: &InputSample,
        position: Vec2,
        local_id: Option<&ConnectionId>,
    ) -> Vec<Message> {
        let mut out = Vec::new();

        if sample.horizontal != self.last_facing {
            self.last_facing = sample.horizontal;
            let mut data = MovementData::at(position)
                .with_velocity_x(sample.horizontal.direction() * self.walk_speed)
                .with_facing(sample.horizontal);
            data.connection_id = local_id.cloned();
            trace!(facing = %sample.horizontal, "Facing changed");
            out.push(Message::Movement(data));
        }

        if let Some(vy) = sample.vertical_impulse {
            let mut data = MovementData::at(position).with_velocity_y(vy);
            data.connection_id = local_id.cloned();
            out.push(Message::Movement(data));
        }

        out
    }

    /// Applies one inbound movement frame.
    pub fn on_remote_movement<B: SceneBinding + ?Sized>(
        &self,
        data: &MovementData,
        local_id: Option<&ConnectionId>,
        peers: &mut PresenceTracker,
        binding: &mut B,
    ) -> RemoteOutcome {
        let Some(id) = data.connection_id.as_ref() else {
            return RemoteOutcome::Unroutable;
        };
        if is_self(local_id, id) {
            return RemoteOutcome::SelfEcho;
        }

        let position = data.position();
        let outcome = if peers.contains(id) {
            RemoteOutcome::Applied
        } else {
            match self.policy {
                SpawnPolicy::LazyFromMovement => {
                    peers.spawn_at(id, position, binding);
                    RemoteOutcome::Spawned
                }
                SpawnPolicy::PresenceOnly => return RemoteOutcome::UnknownPeer,
            }
        };
        let Some(peer) = peers.get_mut(id) else {
            return RemoteOutcome::UnknownPeer;
        };
        if outcome == RemoteOutcome::Applied {
            peer.position = position;
            binding.set_position(peer.handle, position);
        }

        if data.velocity_x.is_some() || data.velocity_y.is_some() {
            if data.velocity_x.is_some() {
                peer.velocity_x = data.velocity_x;
            }
            if data.velocity_y.is_some() {
                peer.velocity_y = data.velocity_y;
            }
            binding.set_velocity(peer.handle, data.velocity_x, data.velocity_y);
        }

        if let Some(facing) = data.facing {
            peer.facing = Some(facing);
            binding.play_pose(peer.handle, facing, facing.is_walking());
        }

        outcome
    }
}
