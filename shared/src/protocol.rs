//! Session protocol vocabulary carried inside frame payloads
//!
//! Envelopes are serialized with bincode. The enum is closed: every message
//! kind must be handled explicitly, and a payload carrying an unknown tag
//! fails to decode, which receivers log and ignore without dropping the
//! connection.

use crate::connection_id::ConnectionId;
use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(255, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Movement keys held by a client at one instant.
///
/// Replaced as a whole on every update so that readers never observe a mix
/// of old and new key states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

impl InputSnapshot {
    pub fn new(left: bool, right: bool, up: bool, down: bool) -> Self {
        Self {
            left,
            right,
            up,
            down,
        }
    }

    pub fn is_idle(&self) -> bool {
        !(self.left || self.right || self.up || self.down)
    }

    /// Direction implied by the held keys, each axis in -1.0..=1.0.
    /// Positive y is up.
    pub fn axis(&self) -> (f32, f32) {
        let mut x = 0.0;
        let mut y = 0.0;
        if self.right {
            x += 1.0;
        }
        if self.left {
            x -= 1.0;
        }
        if self.up {
            y += 1.0;
        }
        if self.down {
            y -= 1.0;
        }
        (x, y)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    Player {
        score: i32,
        name: String,
        color: Color,
    },
    Score {
        score: i32,
        color: Color,
    },
}

/// One entity's state inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity_id: Uuid,
    pub x: f32,
    pub y: f32,
    pub kind: EntityKind,
}

impl EntityUpdate {
    pub fn is_player(&self) -> bool {
        matches!(self.kind, EntityKind::Player { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    AuthenticateRequest {
        name: String,
        secret: String,
    },
    AuthenticationReply {
        authenticated: bool,
        /// Present iff `authenticated`
        identity: Option<ConnectionId>,
        assigned_color: Option<Color>,
    },
    JoinRequest {
        nickname: String,
    },
    ClientInput(InputSnapshot),
    StateSnapshot {
        entities: Vec<EntityUpdate>,
    },
}

impl Envelope {
    pub fn accepted(identity: ConnectionId, assigned_color: Color) -> Self {
        Envelope::AuthenticationReply {
            authenticated: true,
            identity: Some(identity),
            assigned_color: Some(assigned_color),
        }
    }

    pub fn rejected() -> Self {
        Envelope::AuthenticationReply {
            authenticated: false,
            identity: None,
            assigned_color: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(NetError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload).map_err(NetError::Decode)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::AuthenticateRequest { .. } => "AuthenticateRequest",
            Envelope::AuthenticationReply { .. } => "AuthenticationReply",
            Envelope::JoinRequest { .. } => "JoinRequest",
            Envelope::ClientInput(_) => "ClientInput",
            Envelope::StateSnapshot { .. } => "StateSnapshot",
        }
    }
}

/// Placeholder credential policy: both fields must be non-empty.
pub fn credentials_valid(name: &str, secret: &str) -> bool {
    !name.is_empty() && !secret.is_empty()
}
