//! Wire protocol.
//!
//! Every frame is a JSON text message on one WebSocket:
//!
//! ```text
//! {"action": "<kind>", "data": <payload>}
//! ```
//!
//! `data` is left out entirely for requests. The same action name can mean a
//! request or a response depending on whether `data` is present
//! (`connection_id`, `current_connections`).
//!
//! Movement payloads are partial updates. Only `x` and `y` are required; an
//! absent velocity or facing means "leave it as it is" on the receiver, so the
//! encoder never writes `null` placeholders.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{DecodeError, EncodeError},
    math::Vec2,
};

/// Action names as they appear on the wire.
pub mod action {
    pub const CONNECTION_ID: &str = "connection_id";
    pub const JOIN_GAME: &str = "join_game";
    pub const CURRENT_CONNECTIONS: &str = "current_connections";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const MOVEMENT: &str = "movement";
}

/// Identity the remote endpoint assigns to a socket.
///
/// Opaque to clients: it is only compared and echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        ConnectionId::new(s)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        ConnectionId(s)
    }
}

/// Horizontal facing of an actor.
///
/// `Idle` goes over the wire as `"turn"`, the name of the standing pose in
/// the sprite sheet; `"idle"` is accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Left,
    Right,
    #[default]
    #[serde(rename = "turn", alias = "idle")]
    Idle,
}

impl Facing {
    /// Walking poses loop; the idle pose is a single frame.
    pub fn is_walking(self) -> bool {
        matches!(self, Facing::Left | Facing::Right)
    }

    /// Sign of the horizontal velocity for this facing.
    pub fn direction(self) -> f32 {
        match self {
            Facing::Left => -1.0,
            Facing::Right => 1.0,
            Facing::Idle => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Facing::Left => "left",
            Facing::Right => "right",
            Facing::Idle => "turn",
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `movement` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementData {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity_x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity_y: Option<f32>,
    #[serde(
        rename = "directionFacing",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub facing: Option<Facing>,
    /// Routing only: who sent it. Never treated as position data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
}

impl MovementData {
    /// A position-only update.
    pub fn at(position: Vec2) -> Self {
        Self {
            x: position.x,
            y: position.y,
            velocity_x: None,
            velocity_y: None,
            facing: None,
            connection_id: None,
        }
    }

    #[must_use]
    pub fn with_velocity_x(mut self, vx: f32) -> Self {
        self.velocity_x = Some(vx);
        self
    }

    #[must_use]
    pub fn with_velocity_y(mut self, vy: f32) -> Self {
        self.velocity_y = Some(vy);
        self
    }

    #[must_use]
    pub fn with_facing(mut self, facing: Facing) -> Self {
        self.facing = Some(facing);
        self
    }

    #[must_use]
    pub fn from_peer(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    fn check_finite(&self) -> Result<(), EncodeError> {
        let fields = [
            ("x", Some(self.x)),
            ("y", Some(self.y)),
            ("velocityX", self.velocity_x),
            ("velocityY", self.velocity_y),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(EncodeError::NonFinite { field, value });
                }
            }
        }
        Ok(())
    }
}

/// Every message the protocol knows, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // ─── Handshake ───
    /// Client asks for its own identity.
    IdentityRequest,
    /// Server tells the client who it is.
    IdentityAssigned(ConnectionId),

    // ─── Presence ───
    /// Client asks who is already here.
    RosterRequest,
    /// Everyone currently connected, possibly including the asker.
    RosterSnapshot(BTreeSet<ConnectionId>),
    /// A peer connected.
    Joined(ConnectionId),
    /// A peer went away.
    Left(ConnectionId),

    // ─── Gameplay ───
    Movement(MovementData),
}

impl Message {
    /// Wire action name.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::IdentityRequest | Message::IdentityAssigned(_) => action::CONNECTION_ID,
            Message::RosterRequest | Message::RosterSnapshot(_) => action::CURRENT_CONNECTIONS,
            Message::Joined(_) => action::CONNECTED,
            Message::Left(_) => action::DISCONNECTED,
            Message::Movement(_) => action::MOVEMENT,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Serialize)]
struct OutFrame {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Serializes a message into one JSON frame.
pub fn encode(msg: &Message) -> Result<Bytes, EncodeError> {
    let data = match msg {
        Message::IdentityRequest | Message::RosterRequest => None,
        Message::IdentityAssigned(id) | Message::Joined(id) | Message::Left(id) => {
            Some(Value::String(id.as_str().to_owned()))
        }
        Message::RosterSnapshot(ids) => Some(serde_json::to_value(ids)?),
        Message::Movement(m) => {
            m.check_finite()?;
            Some(serde_json::to_value(m)?)
        }
    };
    let frame = OutFrame {
        action: msg.kind(),
        data,
    };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Parses one JSON frame.
///
/// Never panics on hostile input; the caller decides what to do with the
/// error (normally: drop the frame and carry on).
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let Envelope { action, data } = serde_json::from_slice(frame)?;
    match action.as_str() {
        action::CONNECTION_ID => match data {
            None => Ok(Message::IdentityRequest),
            Some(data) => identity(action::CONNECTION_ID, data).map(Message::IdentityAssigned),
        },
        action::JOIN_GAME => Ok(Message::RosterRequest),
        action::CURRENT_CONNECTIONS => match data {
            None => Ok(Message::RosterRequest),
            Some(data) => Ok(Message::RosterSnapshot(serde_json::from_value(data)?)),
        },
        action::CONNECTED => {
            identity(action::CONNECTED, required(action::CONNECTED, data)?).map(Message::Joined)
        }
        action::DISCONNECTED => {
            identity(action::DISCONNECTED, required(action::DISCONNECTED, data)?)
                .map(Message::Left)
        }
        action::MOVEMENT => {
            let data = required(action::MOVEMENT, data)?;
            Ok(Message::Movement(serde_json::from_value(data)?))
        }
        other => Err(DecodeError::UnknownKind(other.to_owned())),
    }
}

fn required(action: &str, data: Option<Value>) -> Result<Value, DecodeError> {
    data.ok_or_else(|| DecodeError::Malformed(format!("`{action}` frame without data")))
}

fn identity(action: &str, data: Value) -> Result<ConnectionId, DecodeError> {
    match data {
        Value::String(s) => Ok(ConnectionId(s)),
        other => Err(DecodeError::Malformed(format!(
            "`{action}` expects an identity string, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = encode(&msg).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    fn wire(msg: &Message) -> Value {
        serde_json::from_slice(&encode(msg).unwrap()).unwrap()
    }

    #[test]
    fn every_kind_roundtrips() {
        roundtrip(Message::IdentityRequest);
        roundtrip(Message::IdentityAssigned("abc".into()));
        roundtrip(Message::RosterRequest);
        roundtrip(Message::RosterSnapshot(BTreeSet::new()));
        roundtrip(Message::RosterSnapshot(
            ["abc", "xyz"].into_iter().map(ConnectionId::from).collect(),
        ));
        roundtrip(Message::Joined("xyz".into()));
        roundtrip(Message::Left("xyz".into()));
    }

    #[test]
    fn movement_roundtrips_with_all_and_no_optionals() {
        roundtrip(Message::Movement(MovementData::at(Vec2::new(10.0, 20.0))));
        roundtrip(Message::Movement(
            MovementData::at(Vec2::new(15.5, -3.25))
                .with_velocity_x(-160.0)
                .with_velocity_y(-330.0)
                .with_facing(Facing::Left)
                .from_peer("xyz".into()),
        ));
    }

    #[test]
    fn requests_have_no_data_field() {
        let v = wire(&Message::IdentityRequest);
        assert_eq!(v, serde_json::json!({ "action": "connection_id" }));
        let v = wire(&Message::RosterRequest);
        assert_eq!(v, serde_json::json!({ "action": "current_connections" }));
    }

    #[test]
    fn movement_omits_absent_fields() {
        let msg = Message::Movement(MovementData::at(Vec2::new(1.0, 2.0)).with_velocity_y(-330.0));
        let v = wire(&msg);
        let data = v["data"].as_object().unwrap();
        assert_eq!(data.len(), 3);
        assert!(data.contains_key("velocityY"));
        assert!(!data.contains_key("velocityX"));
        assert!(!data.contains_key("directionFacing"));
        assert!(!data.contains_key("connectionId"));
    }

    #[test]
    fn movement_uses_wire_field_names() {
        let msg = Message::Movement(
            MovementData::at(Vec2::new(1.0, 2.0))
                .with_velocity_x(160.0)
                .with_facing(Facing::Idle)
                .from_peer("abc".into()),
        );
        let v = wire(&msg);
        assert_eq!(v["action"], "movement");
        assert_eq!(v["data"]["velocityX"], 160.0);
        assert_eq!(v["data"]["directionFacing"], "turn");
        assert_eq!(v["data"]["connectionId"], "abc");
    }

    #[test]
    fn decodes_server_frames() {
        assert_eq!(
            decode(br#"{"action":"connection_id","data":"abc"}"#).unwrap(),
            Message::IdentityAssigned("abc".into())
        );
        let roster = decode(br#"{"action":"current_connections","data":["abc","xyz"]}"#).unwrap();
        match roster {
            Message::RosterSnapshot(ids) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&ConnectionId::from("xyz")));
            }
            other => panic!("expected roster, got {other:?}"),
        }
        assert_eq!(
            decode(br#"{"action":"disconnected","data":"xyz"}"#).unwrap(),
            Message::Left("xyz".into())
        );
    }

    #[test]
    fn join_game_is_a_roster_request() {
        assert_eq!(
            decode(br#"{"action":"join_game"}"#).unwrap(),
            Message::RosterRequest
        );
    }

    #[test]
    fn idle_facing_accepts_both_names() {
        for name in ["turn", "idle"] {
            let frame = format!(
                r#"{{"action":"movement","data":{{"x":1,"y":2,"directionFacing":"{name}"}}}}"#
            );
            match decode(frame.as_bytes()).unwrap() {
                Message::Movement(m) => assert_eq!(m.facing, Some(Facing::Idle)),
                other => panic!("expected movement, got {other:?}"),
            }
        }
    }

    #[test]
    fn null_optionals_read_as_absent() {
        let msg = decode(br#"{"action":"movement","data":{"x":1,"y":2,"velocityX":null}}"#)
            .unwrap();
        assert_eq!(msg, Message::Movement(MovementData::at(Vec2::new(1.0, 2.0))));
    }

    #[test]
    fn garbage_is_malformed_and_does_not_poison_later_frames() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));

        let ok = decode(br#"{"action":"connected","data":"xyz"}"#).unwrap();
        assert_eq!(ok, Message::Joined("xyz".into()));
    }

    #[test]
    fn structurally_invalid_payloads_are_malformed() {
        let cases: [&[u8]; 7] = [
            br#"{"action":"movement","data":{"y":2}}"#,
            br#"{"action":"movement","data":{"x":"one","y":2}}"#,
            br#"{"action":"movement","data":{"x":1,"y":2,"directionFacing":"up"}}"#,
            br#"{"action":"movement"}"#,
            br#"{"action":"connected"}"#,
            br#"{"action":"connection_id","data":42}"#,
            br#"{"data":"abc"}"#,
        ];
        for case in cases {
            let err = decode(case).unwrap_err();
            assert!(
                matches!(err, DecodeError::Malformed(_)),
                "{} -> {err:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn unknown_action_is_reported_by_name() {
        let err = decode(br#"{"action":"chat","data":"hi"}"#).unwrap_err();
        assert_eq!(err, DecodeError::UnknownKind("chat".into()));
        assert!(err.is_unknown_kind());
    }

    #[test]
    fn non_finite_movement_is_rejected_on_encode() {
        let msg = Message::Movement(MovementData::at(Vec2::new(f32::NAN, 0.0)));
        assert!(matches!(
            encode(&msg),
            Err(EncodeError::NonFinite { field: "x", .. })
        ));

        let msg = Message::Movement(
            MovementData::at(Vec2::new(0.0, 0.0)).with_velocity_y(f32::INFINITY),
        );
        assert!(matches!(
            encode(&msg),
            Err(EncodeError::NonFinite { field: "velocityY", .. })
        ));
    }
}
