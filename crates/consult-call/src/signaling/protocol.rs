//! Wire messages exchanged with the room-coordination server.
//!
//! Every frame is a JSON text frame of the form
//! `{"event": "<kebab-case name>", "data": {...}}` with camelCase fields.

use serde::{Deserialize, Serialize};

use crate::room::RoomId;

/// An opaque negotiation blob (SDP offer/answer or ICE candidate).
///
/// The channel relays it verbatim; only the negotiation object reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    WebrtcSignal { room_id: RoomId, signal: SignalPayload },
    VideoToggle { room_id: RoomId, enabled: bool },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::WebrtcSignal { .. } => "webrtc-signal",
            Self::VideoToggle { .. } => "video-toggle",
        }
    }
}

/// Server → client. Room scoping is done by the server, so inbound
/// messages carry no room id we need to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    ParticipantJoined,
    ParticipantLeft,
    WebrtcSignal { signal: SignalPayload },
    VideoToggle { enabled: bool },
}
