//! Peer session: the single negotiation with the remote participant.
//!
//! State machine:
//! ```text
//!   Idle ──(responder start | participant-joined)──▶ Negotiating
//!   Negotiating ──(remote stream)──▶ Connected
//!   Negotiating | Connected ──(participant-joined)──▶ Negotiating   (rebuild)
//!   * ──(close | participant-left | teardown)──▶ Closed
//! ```
//!
//! The negotiation object (offer/answer/ICE engine) lives in a one-element
//! slot. A rebuild detaches the old object's listeners, destroys it, and only
//! then creates its replacement, so nothing from a superseded attempt can
//! touch the session again. Every attempt gets a fresh [`AttemptId`]; events
//! carry it and anything tagged with a stale id is dropped on arrival.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::NegotiationError;
use crate::media::MediaStream;
use crate::room::{Role, RoomId};
use crate::signaling::{SignalPayload, SignalSink};

/// Identifies one negotiation attempt within a session.
pub type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// Something a negotiation object reports back.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Outbound offer/answer/candidate to relay to the remote side.
    Signal(SignalPayload),
    /// The remote media stream is flowing.
    RemoteStream(MediaStream),
    /// The connection closed.
    Close,
    /// Non-fatal; logged and otherwise ignored.
    Error(NegotiationError),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub attempt: AttemptId,
    pub event: NegotiationEvent,
}

/// Event emitter handed to a negotiation object at creation.
///
/// Once the session detaches it, `emit` becomes a no-op.
#[derive(Debug, Clone)]
pub struct NegotiationEvents {
    attempt: AttemptId,
    attached: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl NegotiationEvents {
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn emit(&self, event: NegotiationEvent) {
        if !self.is_attached() {
            trace!(attempt = self.attempt, "Listener detached, event discarded");
            return;
        }
        let _ = self.tx.send(PeerEvent {
            attempt: self.attempt,
            event,
        });
    }
}

/// How a negotiation object should be built.
#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    /// Whether this side generates the offer.
    pub initiator: bool,
    /// Trickle ICE candidates as separate signals.
    pub trickle: bool,
    /// Local media to send; `None` when capture failed (receive-only).
    pub stream: Option<MediaStream>,
}

/// The offer/answer/ICE engine for one attempt.
pub trait Negotiator: Send {
    /// Feed an inbound payload from the remote side.
    fn signal(&mut self, payload: SignalPayload) -> Result<(), NegotiationError>;
    /// Tear down the connection. Must be idempotent.
    fn destroy(&mut self);
    fn is_destroyed(&self) -> bool;
}

pub trait NegotiatorFactory: Send + Sync {
    fn create(
        &self,
        options: NegotiatorOptions,
        events: NegotiationEvents,
    ) -> Result<Box<dyn Negotiator>, NegotiationError>;
}

/// Where the remote participant's video is rendered.
pub trait RemoteView: Send + Sync {
    fn show(&self, stream: &MediaStream);
    fn clear(&self);
}

/// Audio cues for presence changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cue {
    ParticipantJoined,
    ParticipantLeft,
}

pub trait CuePlayer: Send + Sync {
    fn play(&self, cue: Cue) -> anyhow::Result<()>;
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConnectionState {
    pub status: PeerStatus,
    pub remote_stream_present: bool,
    pub remote_video_enabled: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

struct ActiveNegotiation {
    attempt: AttemptId,
    negotiator: Box<dyn Negotiator>,
    listening: Arc<AtomicBool>,
}

impl ActiveNegotiation {
    fn shut_down(mut self) {
        self.listening.store(false, Ordering::Release);
        self.negotiator.destroy();
        debug!(attempt = self.attempt, "Negotiator destroyed");
    }
}

pub struct PeerSession {
    room: RoomId,
    role: Role,
    negotiators: Arc<dyn NegotiatorFactory>,
    signals: Arc<dyn SignalSink>,
    remote_view: Arc<dyn RemoteView>,
    cues: Arc<dyn CuePlayer>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    local: Option<MediaStream>,
    slot: Option<ActiveNegotiation>,
    last_attempt: AttemptId,
    status: PeerStatus,
    remote_stream_present: bool,
    remote_video_enabled: bool,
    connected_at: Option<DateTime<Utc>>,
}

impl PeerSession {
    /// Returns the session and the queue its negotiation objects report on.
    /// Feed everything from that queue back through [`PeerSession::handle`].
    pub fn new(
        room: RoomId,
        role: Role,
        negotiators: Arc<dyn NegotiatorFactory>,
        signals: Arc<dyn SignalSink>,
        remote_view: Arc<dyn RemoteView>,
        cues: Arc<dyn CuePlayer>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            room,
            role,
            negotiators,
            signals,
            remote_view,
            cues,
            events_tx,
            local: None,
            slot: None,
            last_attempt: 0,
            status: PeerStatus::Idle,
            remote_stream_present: false,
            remote_video_enabled: true,
            connected_at: None,
        };
        (session, events_rx)
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Id of the live negotiation attempt, if any.
    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.slot.as_ref().map(|active| active.attempt)
    }

    pub fn snapshot(&self) -> PeerConnectionState {
        PeerConnectionState {
            status: self.status,
            remote_stream_present: self.remote_stream_present,
            remote_video_enabled: self.remote_video_enabled,
            connected_at: self.connected_at,
        }
    }

    /// Local media is settled (or failed). The responder starts negotiating
    /// right away since the initiator may already be waiting; the initiator
    /// holds off until it sees the remote side join.
    pub fn start(&mut self, local: Option<MediaStream>) {
        self.local = local;
        match self.role {
            Role::Responder => {
                info!(room = %self.room, "Responder ready, negotiating");
                self.negotiate();
            }
            Role::Initiator => {
                debug!(room = %self.room, "Initiator ready, waiting for participant");
            }
        }
    }

    /// The remote side (re)joined. Always starts a fresh attempt.
    pub fn on_participant_joined(&mut self) {
        self.play(Cue::ParticipantJoined);
        if matches!(self.status, PeerStatus::Negotiating | PeerStatus::Connected) {
            info!(room = %self.room, "Participant rejoined, rebuilding peer connection");
        } else {
            info!(room = %self.room, "Participant joined");
        }
        self.negotiate();
    }

    pub fn on_participant_left(&mut self) {
        info!(room = %self.room, "Participant left");
        self.play(Cue::ParticipantLeft);
        self.close();
    }

    /// Inbound payload from the remote side.
    pub fn on_signal(&mut self, payload: SignalPayload) {
        match self.slot.as_mut() {
            Some(active) if !active.negotiator.is_destroyed() => {
                if let Err(e) = active.negotiator.signal(payload) {
                    debug!(attempt = active.attempt, error = %e, "Negotiator rejected signal");
                }
            }
            _ => trace!(room = %self.room, "No live negotiator, signal dropped"),
        }
    }

    pub fn on_remote_video_toggle(&mut self, enabled: bool) {
        self.remote_video_enabled = enabled;
    }

    /// Apply an event reported by a negotiation object.
    pub fn handle(&mut self, event: PeerEvent) {
        let current = self.current_attempt();
        if current != Some(event.attempt) {
            trace!(
                attempt = event.attempt,
                current = ?current,
                "Event from superseded attempt dropped"
            );
            return;
        }

        match event.event {
            NegotiationEvent::Signal(payload) => self.signals.send_signal(&self.room, payload),
            NegotiationEvent::RemoteStream(stream) => {
                info!(room = %self.room, attempt = event.attempt, "Remote stream connected");
                self.status = PeerStatus::Connected;
                self.remote_stream_present = true;
                self.connected_at = Some(Utc::now());
                self.remote_view.show(&stream);
            }
            NegotiationEvent::Close => {
                info!(room = %self.room, attempt = event.attempt, "Peer connection closed");
                self.close();
            }
            NegotiationEvent::Error(e) => {
                warn!(
                    room = %self.room,
                    attempt = event.attempt,
                    error = %e,
                    "Negotiation error ignored"
                );
            }
        }
    }

    /// Unmount / room change.
    pub fn teardown(&mut self) {
        self.close();
    }

    fn negotiate(&mut self) {
        self.release();
        self.clear_remote();
        // A fresh remote peer starts with its camera on.
        self.remote_video_enabled = true;

        self.last_attempt += 1;
        let attempt = self.last_attempt;
        let listening = Arc::new(AtomicBool::new(true));
        let events = NegotiationEvents {
            attempt,
            attached: Arc::clone(&listening),
            tx: self.events_tx.clone(),
        };
        let options = NegotiatorOptions {
            initiator: self.role.is_initiator(),
            trickle: true,
            stream: self.local.clone(),
        };

        self.status = PeerStatus::Negotiating;
        match self.negotiators.create(options, events) {
            Ok(negotiator) => {
                debug!(room = %self.room, attempt, "Negotiator created");
                self.slot = Some(ActiveNegotiation {
                    attempt,
                    negotiator,
                    listening,
                });
            }
            Err(e) => {
                // Stays Negotiating; the next join retries.
                warn!(room = %self.room, attempt, error = %e, "Failed to create negotiator");
            }
        }
    }

    fn close(&mut self) {
        self.release();
        self.clear_remote();
        self.status = PeerStatus::Closed;
    }

    fn release(&mut self) {
        if let Some(active) = self.slot.take() {
            active.shut_down();
        }
    }

    fn clear_remote(&mut self) {
        self.remote_stream_present = false;
        self.connected_at = None;
        self.remote_view.clear();
    }

    fn play(&self, cue: Cue) {
        if let Err(e) = self.cues.play(cue) {
            debug!(?cue, error = %e, "Cue playback failed");
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.release();
    }
}
