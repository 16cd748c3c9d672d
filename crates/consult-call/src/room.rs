//! Room identity and participant roles.
//!
//! Both come from the appointment service before a call is mounted; this
//! crate never decides them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque room identifier shared by the two participants of a consultation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Negotiation polarity. Fixed when the room is joined and never flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the offer, but only once the remote side is known to be present.
    Initiator,
    /// Answers offers; starts negotiating as soon as local media is ready.
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Who is on this end of the consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Clinician,
    Patient,
}

impl ParticipantKind {
    /// The clinician always initiates.
    pub fn role(self) -> Role {
        match self {
            Self::Clinician => Role::Initiator,
            Self::Patient => Role::Responder,
        }
    }
}

/// What the appointment service hands us before a call is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParams {
    pub room_id: RoomId,
    pub role: Role,
}

impl CallParams {
    pub fn new(room_id: impl Into<RoomId>, role: Role) -> Self {
        Self {
            room_id: room_id.into(),
            role,
        }
    }

    pub fn for_participant(room_id: impl Into<RoomId>, kind: ParticipantKind) -> Self {
        Self::new(room_id, kind.role())
    }
}
