//! Call controller: composes capture, signaling and the peer session.
//!
//! One task per mounted call owns every piece of call state and processes
//! its inputs one at a time: UI commands, signaling events and negotiation
//! events all arrive on queues and are drained by a single `select!` loop.
//! The UI reads [`CallState`] from a watch channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::media::{MediaCaptureGuard, MediaDevices, MediaStream, PreviewSink};
use crate::peer::{CuePlayer, NegotiatorFactory, PeerSession, PeerStatus, RemoteView};
use crate::room::CallParams;
use crate::signaling::{ChannelEvent, SignalSink, SignalingChannel, Subscription};

/// Platform implementations the call runs against.
#[derive(Clone)]
pub struct CallServices {
    pub devices: Arc<dyn MediaDevices>,
    pub preview: Arc<dyn PreviewSink>,
    pub remote_view: Arc<dyn RemoteView>,
    pub cues: Arc<dyn CuePlayer>,
    pub negotiators: Arc<dyn NegotiatorFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// Waiting on camera/microphone (possibly an open permission prompt).
    AcquiringMedia,
    InRoom,
    Ended,
}

/// Everything the call UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallState {
    pub phase: CallPhase,
    #[serde(skip)]
    pub local_stream: Option<MediaStream>,
    pub remote_stream_present: bool,
    pub remote_video_enabled: bool,
    pub capture_error: Option<CaptureError>,
    pub muted: bool,
    pub video_enabled: bool,
    pub status: PeerStatus,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            phase: CallPhase::AcquiringMedia,
            local_stream: None,
            remote_stream_present: false,
            remote_video_enabled: true,
            capture_error: None,
            muted: false,
            video_enabled: true,
            status: PeerStatus::Idle,
            connected_at: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    ToggleMute,
    ToggleVideo,
    Unmount(oneshot::Sender<()>),
}

/// A mounted call.
///
/// Prefer [`CallController::unmount`]; dropping the controller only sends a
/// best-effort `leave-room` and aborts the call task.
pub struct CallController {
    call_id: Uuid,
    params: CallParams,
    channel: Arc<SignalingChannel>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
    task: Option<JoinHandle<()>>,
}

impl CallController {
    /// Connect the channel and start the call task. Must be called from
    /// within a Tokio runtime.
    pub fn mount(params: CallParams, channel: SignalingChannel, services: CallServices) -> Self {
        let call_id = Uuid::new_v4();
        let channel = Arc::new(channel);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(CallState::default());

        info!(%call_id, room = %params.room_id, role = ?params.role, "Mounting call");
        channel.connect();

        let task = tokio::spawn(run_call(
            call_id,
            params.clone(),
            Arc::clone(&channel),
            services,
            commands_rx,
            state_tx,
        ));

        Self {
            call_id,
            params,
            channel,
            commands,
            state,
            task: Some(task),
        }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn params(&self) -> &CallParams {
        &self.params
    }

    /// Follows every state change.
    pub fn state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Ignored until a local stream exists.
    pub fn toggle_mute(&self) {
        let _ = self.commands.send(Command::ToggleMute);
    }

    /// Ignored until a local stream exists. Announces the new value to the
    /// remote side.
    pub fn toggle_video(&self) {
        let _ = self.commands.send(Command::ToggleVideo);
    }

    /// Leave the room, tear down the peer session, stop local tracks and
    /// disconnect. Resolves once all of that has happened.
    pub async fn unmount(mut self) {
        let Some(task) = self.task.take() else { return };

        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Unmount(reply)).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = task.await {
            warn!(call_id = %self.call_id, error = %e, "Call task ended abnormally");
        }
        info!(call_id = %self.call_id, "Call unmounted");
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(call_id = %self.call_id, "Controller dropped without unmount");
            self.channel.leave_room(&self.params.room_id);
            self.channel.disconnect();
            task.abort();
        }
    }
}

enum Acquisition {
    Settled(Result<MediaStream, CaptureError>),
    Unmounted(Option<oneshot::Sender<()>>),
}

async fn run_call(
    call_id: Uuid,
    params: CallParams,
    channel: Arc<SignalingChannel>,
    services: CallServices,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<CallState>,
) {
    let CallParams { room_id: room, role } = params;
    let mut capture =
        MediaCaptureGuard::new(Arc::clone(&services.devices), Arc::clone(&services.preview));

    // The device prompt may never resolve; only an unmount gets us out.
    let acquisition = {
        let acquire = capture.acquire();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                result = &mut acquire => break Acquisition::Settled(result),
                cmd = commands.recv() => match cmd {
                    Some(Command::Unmount(reply)) => break Acquisition::Unmounted(Some(reply)),
                    Some(cmd) => debug!(%call_id, ?cmd, "No local stream yet, ignoring"),
                    None => break Acquisition::Unmounted(None),
                },
            }
        }
    };

    let local = match acquisition {
        Acquisition::Settled(Ok(stream)) => Some(stream),
        Acquisition::Settled(Err(e)) => {
            warn!(%call_id, error = %e, "{}", e.user_message());
            None
        }
        Acquisition::Unmounted(reply) => {
            info!(%call_id, "Unmounted while acquiring media");
            capture.release();
            channel.disconnect();
            publish(&state, CallPhase::Ended, &capture, None);
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let subscriptions = subscribe(&channel, &events_tx);

    channel.join_room(&room);
    let signals: Arc<dyn SignalSink> = channel.clone();
    let (mut session, mut peer_events) = PeerSession::new(
        room.clone(),
        role,
        Arc::clone(&services.negotiators),
        signals,
        Arc::clone(&services.remote_view),
        Arc::clone(&services.cues),
    );
    session.start(local);
    publish(&state, CallPhase::InRoom, &capture, Some(&session));

    let reply = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::ToggleMute) => {
                    if capture.stream().is_some() {
                        capture.set_muted(!capture.muted());
                    }
                }
                Some(Command::ToggleVideo) => {
                    if capture.stream().is_some() {
                        let enabled = !capture.video_enabled();
                        capture.set_video_enabled(enabled);
                        channel.send_video_toggle(&room, enabled);
                    }
                }
                Some(Command::Unmount(reply)) => break Some(reply),
                None => break None,
            },
            Some(event) = events.recv() => match event {
                ChannelEvent::ParticipantJoined => session.on_participant_joined(),
                ChannelEvent::ParticipantLeft => session.on_participant_left(),
                ChannelEvent::Signal(payload) => session.on_signal(payload),
                ChannelEvent::VideoToggle(enabled) => session.on_remote_video_toggle(enabled),
                ChannelEvent::Reconnected => info!(%call_id, room = %room, "Signaling restored"),
            },
            Some(event) = peer_events.recv() => session.handle(event),
        }
        publish(&state, CallPhase::InRoom, &capture, Some(&session));
    };

    // Listeners go first so nothing arrives mid-teardown.
    drop(subscriptions);
    channel.leave_room(&room);
    session.teardown();
    capture.release();
    channel.disconnect();
    publish(&state, CallPhase::Ended, &capture, Some(&session));
    info!(%call_id, room = %room, "Call ended");

    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

fn subscribe(
    channel: &SignalingChannel,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> Vec<Subscription> {
    let forward = |event: ChannelEvent| {
        let events = events.clone();
        move || {
            let _ = events.send(event.clone());
        }
    };
    let signals = events.clone();
    let toggles = events.clone();

    vec![
        channel.on_participant_joined(forward(ChannelEvent::ParticipantJoined)),
        channel.on_participant_left(forward(ChannelEvent::ParticipantLeft)),
        channel.on_signal(move |payload| {
            let _ = signals.send(ChannelEvent::Signal(payload));
        }),
        channel.on_video_toggle(move |enabled| {
            let _ = toggles.send(ChannelEvent::VideoToggle(enabled));
        }),
        channel.on_reconnect(forward(ChannelEvent::Reconnected)),
    ]
}

fn publish(
    state: &watch::Sender<CallState>,
    phase: CallPhase,
    capture: &MediaCaptureGuard,
    session: Option<&PeerSession>,
) {
    let peer = session.map(PeerSession::snapshot);
    let next = CallState {
        phase,
        local_stream: capture.stream().cloned(),
        remote_stream_present: peer.as_ref().is_some_and(|p| p.remote_stream_present),
        remote_video_enabled: peer.as_ref().map_or(true, |p| p.remote_video_enabled),
        capture_error: capture.capture_error(),
        muted: capture.muted(),
        video_enabled: capture.video_enabled(),
        status: peer.as_ref().map_or(PeerStatus::Idle, |p| p.status),
        connected_at: peer.and_then(|p| p.connected_at),
    };
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
