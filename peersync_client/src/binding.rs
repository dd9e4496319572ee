//! Scene/entity binding.
//!
//! The sync core never touches rendering, physics or input devices. The host
//! engine implements [`SceneBinding`] and the core calls it to spawn, move
//! and animate actors. [`HeadlessScene`] is an in-memory implementation for
//! tests and bots.

use std::collections::{BTreeMap, HashMap, VecDeque};

use peersync_shared::{math::Vec2, protocol::ConnectionId, protocol::Facing};

use crate::input::{InputScript, InputSample};

/// Engine-side handle of a spawned actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u64);

/// What the core needs from the host environment.
pub trait SceneBinding: Send {
    fn create_local_actor(&mut self, spawn: Vec2) -> EntityHandle;
    fn create_peer_actor(&mut self, id: &ConnectionId, position: Vec2) -> EntityHandle;
    fn destroy_peer_actor(&mut self, id: &ConnectionId);
    fn set_position(&mut self, handle: EntityHandle, position: Vec2);
    /// `None` leaves that axis as it is.
    fn set_velocity(&mut self, handle: EntityHandle, vx: Option<f32>, vy: Option<f32>);
    /// `looping` selects a repeating walk cycle over a one-shot pose.
    fn play_pose(&mut self, handle: EntityHandle, pose: Facing, looping: bool);
    fn sample_local_input(&mut self) -> InputSample;
    fn current_position(&self, handle: EntityHandle) -> Vec2;

    /// Called once per tick before input is sampled, with the tick length
    /// in seconds. Engines with their own physics step leave it alone.
    fn advance(&mut self, _dt: f32) {}
}

/// Recorded state of one headless actor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeadlessActor {
    pub peer: Option<ConnectionId>,
    pub position: Vec2,
    pub velocity_x: Option<f32>,
    pub velocity_y: Option<f32>,
    pub pose: Option<(Facing, bool)>,
    /// How many times a pose was started.
    pub pose_plays: u32,
}

/// Scene with no engine behind it: actors are plain records.
///
/// The local actor walks: `advance` moves it by its horizontal velocity.
/// There is no gravity, so vertical velocity is recorded but never applied.
#[derive(Default)]
pub struct HeadlessScene {
    next_handle: u64,
    local: Option<EntityHandle>,
    actors: BTreeMap<EntityHandle, HeadlessActor>,
    peers: HashMap<ConnectionId, EntityHandle>,
    queued_input: VecDeque<InputSample>,
    script: Option<InputScript>,
    peer_creates: u64,
    peer_destroys: u64,
}

impl HeadlessScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input comes from `script` once queued samples run out.
    pub fn with_script(script: InputScript) -> Self {
        Self {
            script: Some(script),
            ..Self::default()
        }
    }

    /// Queues one input sample; queued samples win over the script.
    pub fn push_input(&mut self, sample: InputSample) {
        self.queued_input.push_back(sample);
    }

    pub fn actor(&self, handle: EntityHandle) -> Option<&HeadlessActor> {
        self.actors.get(&handle)
    }

    pub fn peer_actor(&self, id: &ConnectionId) -> Option<&HeadlessActor> {
        self.peers.get(id).and_then(|h| self.actors.get(h))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// How many times `create_peer_actor` was called.
    pub fn peer_creates(&self) -> u64 {
        self.peer_creates
    }

    /// How many times `destroy_peer_actor` was called for a live peer.
    pub fn peer_destroys(&self) -> u64 {
        self.peer_destroys
    }

    /// Puts an actor somewhere else without going through a tick.
    pub fn teleport(&mut self, handle: EntityHandle, position: Vec2) {
        self.set_position(handle, position);
    }

    fn spawn(&mut self, peer: Option<ConnectionId>, position: Vec2) -> EntityHandle {
        let handle = EntityHandle(self.next_handle);
        self.next_handle += 1;
        self.actors.insert(
            handle,
            HeadlessActor {
                peer,
                position,
                ..HeadlessActor::default()
            },
        );
        handle
    }
}

impl SceneBinding for HeadlessScene {
    fn create_local_actor(&mut self, spawn: Vec2) -> EntityHandle {
        let handle = self.spawn(None, spawn);
        self.local = Some(handle);
        handle
    }

    fn create_peer_actor(&mut self, id: &ConnectionId, position: Vec2) -> EntityHandle {
        self.peer_creates += 1;
        let handle = self.spawn(Some(id.clone()), position);
        if let Some(old) = self.peers.insert(id.clone(), handle) {
            self.actors.remove(&old);
        }
        handle
    }

    fn destroy_peer_actor(&mut self, id: &ConnectionId) {
        if let Some(handle) = self.peers.remove(id) {
            self.actors.remove(&handle);
            self.peer_destroys += 1;
        }
    }

    fn set_position(&mut self, handle: EntityHandle, position: Vec2) {
        if let Some(actor) = self.actors.get_mut(&handle) {
            actor.position = position;
        }
    }

    fn set_velocity(&mut self, handle: EntityHandle, vx: Option<f32>, vy: Option<f32>) {
        if let Some(actor) = self.actors.get_mut(&handle) {
            if vx.is_some() {
                actor.velocity_x = vx;
            }
            if vy.is_some() {
                actor.velocity_y = vy;
            }
        }
    }

    fn play_pose(&mut self, handle: EntityHandle, pose: Facing, looping: bool) {
        if let Some(actor) = self.actors.get_mut(&handle) {
            actor.pose = Some((pose, looping));
            actor.pose_plays += 1;
        }
    }

    fn sample_local_input(&mut self) -> InputSample {
        if let Some(sample) = self.queued_input.pop_front() {
            return sample;
        }
        self.script
            .as_mut()
            .map(InputScript::next_sample)
            .unwrap_or_default()
    }

    fn current_position(&self, handle: EntityHandle) -> Vec2 {
        self.actors
            .get(&handle)
            .map(|a| a.position)
            .unwrap_or_default()
    }

    fn advance(&mut self, dt: f32) {
        let Some(actor) = self.local.and_then(|h| self.actors.get_mut(&h)) else {
            return;
        };
        if let Some(vx) = actor.velocity_x {
            actor.position.x += vx * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_axes_are_independent() {
        let mut scene = HeadlessScene::new();
        let h = scene.create_local_actor(Vec2::new(1.0, 2.0));
        scene.set_velocity(h, Some(160.0), None);
        scene.set_velocity(h, None, Some(-330.0));
        let actor = scene.actor(h).unwrap();
        assert_eq!(actor.velocity_x, Some(160.0));
        assert_eq!(actor.velocity_y, Some(-330.0));
    }

    #[test]
    fn local_actor_walks_on_advance() {
        let mut scene = HeadlessScene::new();
        let local = scene.create_local_actor(Vec2::new(100.0, 450.0));
        let peer = scene.create_peer_actor(&"xyz".into(), Vec2::new(0.0, 0.0));
        scene.set_velocity(local, Some(160.0), Some(-330.0));
        scene.set_velocity(peer, Some(160.0), None);

        scene.advance(0.5);
        assert_eq!(scene.current_position(local), Vec2::new(180.0, 450.0));
        // Peers only move when the network says so.
        assert_eq!(scene.current_position(peer), Vec2::new(0.0, 0.0));

        scene.teleport(local, Vec2::new(5.0, 6.0));
        scene.advance(0.0);
        assert_eq!(scene.current_position(local), Vec2::new(5.0, 6.0));
    }

    #[test]
    fn destroy_unknown_peer_is_a_no_op() {
        let mut scene = HeadlessScene::new();
        scene.destroy_peer_actor(&ConnectionId::from("ghost"));
        assert_eq!(scene.peer_destroys(), 0);
    }

    #[test]
    fn queued_input_beats_script() {
        let mut scene = HeadlessScene::with_script(InputScript::patrol(-330.0));
        scene.push_input(InputSample::walking(Facing::Left));
        assert_eq!(scene.sample_local_input().horizontal, Facing::Left);
        assert_eq!(scene.sample_local_input().horizontal, Facing::Right);
    }
}
