//! Presence tracking.
//!
//! Keeps the table of remote peers, keyed by connection identity, and the
//! scene actors bound to them. Invariants:
//! - at most one [`PeerEntity`] per identity;
//! - never one for the local identity.

use std::collections::{BTreeMap, BTreeSet};

use peersync_shared::{
    math::Vec2,
    protocol::{ConnectionId, Facing},
};
use tracing::{debug, info};

use crate::binding::{EntityHandle, SceneBinding};

/// One remote participant's avatar.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntity {
    pub connection_id: ConnectionId,
    pub handle: EntityHandle,
    pub position: Vec2,
    /// `None` until some movement frame carries it.
    pub velocity_x: Option<f32>,
    pub velocity_y: Option<f32>,
    pub facing: Option<Facing>,
}

/// True when `id` is us. An unassigned local identity matches nothing.
pub fn is_self(local: Option<&ConnectionId>, id: &ConnectionId) -> bool {
    local == Some(id)
}

pub struct PresenceTracker {
    peers: BTreeMap<ConnectionId, PeerEntity>,
    spawn: Vec2,
}

impl PresenceTracker {
    /// `spawn` is where peers appear when only their presence is known.
    pub fn new(spawn: Vec2) -> Self {
        Self {
            peers: BTreeMap::new(),
            spawn,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&PeerEntity> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntity> {
        self.peers.values()
    }

    /// Handles a roster snapshot. Returns how many peers were created.
    pub fn on_roster<B: SceneBinding + ?Sized>(
        &mut self,
        ids: &BTreeSet<ConnectionId>,
        local: Option<&ConnectionId>,
        binding: &mut B,
    ) -> usize {
        let mut created = 0;
        for id in ids {
            if self.on_joined(id, local, binding) {
                created += 1;
            }
        }
        debug!(listed = ids.len(), created, "Roster applied");
        created
    }

    /// Handles a join. Idempotent; returns whether a peer was created.
    pub fn on_joined<B: SceneBinding + ?Sized>(
        &mut self,
        id: &ConnectionId,
        local: Option<&ConnectionId>,
        binding: &mut B,
    ) -> bool {
        if is_self(local, id) || self.peers.contains_key(id) {
            return false;
        }
        let spawn = self.spawn;
        self.spawn_at(id, spawn, binding);
        true
    }

    /// Handles a leave. Returns whether a peer was removed.
    pub fn on_left<B: SceneBinding + ?Sized>(
        &mut self,
        id: &ConnectionId,
        local: Option<&ConnectionId>,
        binding: &mut B,
    ) -> bool {
        if is_self(local, id) {
            return false;
        }
        match self.peers.remove(id) {
            Some(_) => {
                binding.destroy_peer_actor(id);
                info!(peer = %id, "Peer left");
                true
            }
            None => {
                debug!(peer = %id, "Leave for unknown peer");
                false
            }
        }
    }

    /// Destroys every tracked peer (scene exit). Returns how many.
    pub fn teardown<B: SceneBinding + ?Sized>(&mut self, binding: &mut B) -> usize {
        let peers = std::mem::take(&mut self.peers);
        for id in peers.keys() {
            binding.destroy_peer_actor(id);
        }
        debug!(count = peers.len(), "Presence torn down");
        peers.len()
    }

    pub(crate) fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut PeerEntity> {
        self.peers.get_mut(id)
    }

    /// Creates a peer that is known not to exist yet.
    pub(crate) fn spawn_at<B: SceneBinding + ?Sized>(
        &mut self,
        id: &ConnectionId,
        position: Vec2,
        binding: &mut B,
    ) -> &mut PeerEntity {
        let handle = binding.create_peer_actor(id, position);
        info!(peer = %id, x = position.x, y = position.y, "Peer joined");
        self.peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntity {
                connection_id: id.clone(),
                handle,
                position,
                velocity_x: None,
                velocity_y: None,
                facing: None,
            })
    }
}
