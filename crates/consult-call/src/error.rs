//! Error types for the call core.
//!
//! None of these escape the call as a hard failure: capture errors are
//! surfaced as UI state, signaling errors are healed by reconnecting and
//! negotiation errors are only logged.

use serde::Serialize;
use thiserror::Error;

/// Why the local camera/microphone could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureError {
    /// No camera or microphone hardware was found.
    #[error("no capture device found")]
    NoDevice,

    /// The user or the operating system denied access.
    #[error("capture permission denied")]
    PermissionDenied,

    /// Any other acquisition failure.
    #[error("media capture failed")]
    Unknown,
}

impl CaptureError {
    /// Classify a device API failure by its error name.
    pub fn classify(err: &DeviceError) -> Self {
        match err.name.as_str() {
            "NotFoundError" | "DevicesNotFoundError" => Self::NoDevice,
            "NotAllowedError" | "PermissionDeniedError" => Self::PermissionDenied,
            _ => Self::Unknown,
        }
    }

    /// Message shown in place of the local preview.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoDevice => "No camera detected.",
            Self::PermissionDenied => "Camera access permission denied.",
            Self::Unknown => "Error accessing the camera. Check permissions and devices.",
        }
    }
}

/// A failure reported by the platform media device API.
///
/// `name` follows the DOM exception naming (`NotFoundError`,
/// `NotAllowedError`, ...), which is what [`CaptureError::classify`] keys on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct DeviceError {
    pub name: String,
    pub message: String,
}

impl DeviceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Errors from the signaling transport.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The channel has no live link to the server.
    #[error("Signaling channel is not connected")]
    NotConnected,

    /// A generic error string.
    #[error("{0}")]
    Other(String),
}

/// A non-fatal failure inside a negotiation object (bad SDP, ICE failure...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("negotiation error: {0}")]
pub struct NegotiationError(pub String);

impl NegotiationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_devices() {
        for name in ["NotFoundError", "DevicesNotFoundError"] {
            let err = DeviceError::new(name, "no camera");
            assert_eq!(CaptureError::classify(&err), CaptureError::NoDevice);
        }
    }

    #[test]
    fn classifies_denied_permission() {
        for name in ["NotAllowedError", "PermissionDeniedError"] {
            let err = DeviceError::new(name, "denied");
            assert_eq!(CaptureError::classify(&err), CaptureError::PermissionDenied);
        }
    }

    #[test]
    fn anything_else_is_unknown() {
        for name in ["GenericError", "NotReadableError", "OverconstrainedError", ""] {
            let err = DeviceError::new(name, "boom");
            assert_eq!(CaptureError::classify(&err), CaptureError::Unknown);
        }
    }

    #[test]
    fn every_kind_has_a_distinct_message() {
        let messages = [
            CaptureError::NoDevice.user_message(),
            CaptureError::PermissionDenied.user_message(),
            CaptureError::Unknown.user_message(),
        ];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
        assert_ne!(messages[0], messages[2]);
    }
}
