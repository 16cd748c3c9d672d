//! Two-party consultation call core.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use consult_call::{CallController, CallParams, CallServices, ParticipantKind, SignalingChannel};
//!
//! # async fn run(services: CallServices) -> anyhow::Result<()> {
//! let config = consult_call::config::load()?;
//! let channel = SignalingChannel::from_config(&config);
//! let params = CallParams::for_participant("appt-42", ParticipantKind::Patient);
//!
//! let call = CallController::mount(params, channel, services);
//! let mut state = call.state();
//! state.changed().await?;
//! call.toggle_video();
//!
//! call.unmount().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use controller::{CallController, CallPhase, CallServices, CallState};
pub use error::{CaptureError, DeviceError, NegotiationError, SignalingError};
pub use media::{MediaCaptureGuard, MediaStream};
pub use peer::{PeerSession, PeerStatus};
pub use room::{CallParams, ParticipantKind, Role, RoomId};
pub use signaling::{SignalingChannel, Subscription};
