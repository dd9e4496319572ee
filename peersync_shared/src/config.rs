//! Configuration system.
//!
//! Loads sync configuration from JSON strings/files. Every field has a
//! default, so a config file only needs the keys it wants to change.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::math::Vec2;

/// What to do with a movement frame from a peer nobody announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPolicy {
    /// Only `connected` / `current_connections` create peers; stray
    /// movement is dropped.
    PresenceOnly,
    /// Presence events still create peers, but the first movement from an
    /// unseen peer also spawns it, at the reported position.
    #[default]
    LazyFromMovement,
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket URL the client connects to.
    pub server_url: String,
    /// Address the relay server listens on.
    pub listen_addr: String,
    /// Input sampling rate (client frame rate).
    pub tick_hz: u32,
    /// Where actors appear when no position is known.
    pub spawn: Vec2,
    /// Horizontal speed of a walking actor.
    pub walk_speed: f32,
    /// Vertical velocity applied by a jump (negative is up).
    pub jump_velocity: f32,
    pub spawn_policy: SpawnPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:40080".to_string(),
            listen_addr: "127.0.0.1:40080".to_string(),
            tick_hz: 60,
            spawn: Vec2::new(100.0, 450.0),
            walk_speed: 160.0,
            jump_velocity: -330.0,
            spawn_policy: SpawnPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Horizontal velocity for a facing at the configured walk speed.
    pub fn walk_velocity(&self, facing: crate::protocol::Facing) -> f32 {
        facing.direction() * self.walk_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Facing;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = SyncConfig::from_json_str(
            r#"{ "server_url": "ws://example:9000", "spawn_policy": "presence_only" }"#,
        )
        .unwrap();
        assert_eq!(cfg.server_url, "ws://example:9000");
        assert_eq!(cfg.spawn_policy, SpawnPolicy::PresenceOnly);
        assert_eq!(cfg.tick_hz, 60);
        assert_eq!(cfg.spawn, Vec2::new(100.0, 450.0));
    }

    #[test]
    fn walk_velocity_follows_facing() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.walk_velocity(Facing::Left), -160.0);
        assert_eq!(cfg.walk_velocity(Facing::Right), 160.0);
        assert_eq!(cfg.walk_velocity(Facing::Idle), 0.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = SyncConfig::from_json_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("read config"));
    }
}
