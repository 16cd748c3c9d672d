//! Room signaling channel.
//!
//! A persistent, self-healing connection to the room-coordination server:
//! - presence events (`participant-joined` / `participant-left`)
//! - opaque negotiation payloads relayed between the two participants
//! - camera on/off notifications
//!
//! Sends are fire-and-forget. Anything sent while the link is down is
//! dropped, and every time a link comes up the current room is joined again
//! so the server's presence view is restored after a silent reconnect.

pub mod protocol;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::room::RoomId;

pub use protocol::{ClientMessage, ServerMessage, SignalPayload};
pub use transport::{Connector, Link, LinkEnd, WebSocketConnector};

/// Something that can relay outbound negotiation payloads for a room.
///
/// [`SignalingChannel`] is the production implementation; the peer session
/// only depends on this seam.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, room: &RoomId, payload: SignalPayload);
}

/// An inbound event, as dispatched to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ParticipantJoined,
    ParticipantLeft,
    Signal(SignalPayload),
    VideoToggle(bool),
    /// A link came up again after having been lost.
    Reconnected,
}

impl From<ServerMessage> for ChannelEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::ParticipantJoined => Self::ParticipantJoined,
            ServerMessage::ParticipantLeft => Self::ParticipantLeft,
            ServerMessage::WebrtcSignal { signal } => Self::Signal(signal),
            ServerMessage::VideoToggle { enabled } => Self::VideoToggle(enabled),
        }
    }
}

/// Backoff for failed connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts > max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// A registered event handler. Dropping it (or calling [`cancel`]) removes
/// the handler; a dispatch that starts afterwards, or is still walking its
/// handler snapshot, skips it. An invocation already running on another
/// thread is allowed to finish.
///
/// [`cancel`]: Subscription::cancel
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    live: Arc<AtomicBool>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Link + room state. One lock so that "join while connecting" and
/// "connected, re-join" cannot both send.
#[derive(Default)]
struct LinkState {
    outbound: Option<mpsc::UnboundedSender<String>>,
    room: Option<RoomId>,
}

struct Shared {
    link: Mutex<LinkState>,
    registry: Arc<Mutex<Registry>>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn send(&self, msg: &ClientMessage) {
        let state = lock(&self.link);
        send_on(&state, msg);
    }

    /// Install a fresh link and restore presence on it.
    fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        let mut state = lock(&self.link);
        state.outbound = Some(outbound);
        if let Some(room_id) = state.room.clone() {
            info!(room = %room_id, "Signaling: re-joining room");
            send_on(&state, &ClientMessage::JoinRoom { room_id });
        }
        drop(state);
        self.connected.send_replace(true);
    }

    /// Forget `outbound` if it is still the current link.
    fn detach(&self, outbound: &mpsc::UnboundedSender<String>) {
        let mut state = lock(&self.link);
        if state
            .outbound
            .as_ref()
            .is_some_and(|current| current.same_channel(outbound))
        {
            state.outbound = None;
            drop(state);
            self.connected.send_replace(false);
        }
    }

    fn detach_any(&self) {
        lock(&self.link).outbound = None;
        self.connected.send_replace(false);
    }

    fn dispatch(&self, event: &ChannelEvent) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

fn send_on(state: &LinkState, msg: &ClientMessage) {
    let Some(outbound) = &state.outbound else {
        debug!(event = msg.event_name(), "Signaling: not connected, dropping message");
        return;
    };
    match serde_json::to_string(msg) {
        Ok(frame) => {
            if outbound.send(frame).is_err() {
                debug!(event = msg.event_name(), "Signaling: link closed, dropping message");
            }
        }
        Err(e) => {
            error!(event = msg.event_name(), error = %e, "Signaling: failed to encode message")
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of the room-coordination protocol.
///
/// ```rust,no_run
/// use consult_call::room::RoomId;
/// use consult_call::signaling::{SignalingChannel, WebSocketConnector};
///
/// #[tokio::main]
/// async fn main() {
///     let channel = SignalingChannel::new(WebSocketConnector::new("ws://localhost:4000"));
///     let _joined = channel.on_participant_joined(|| println!("the other side is here"));
///     channel.connect();
///     channel.join_room(&RoomId::new("appt-42"));
/// }
/// ```
pub struct SignalingChannel {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SignalingChannel {
    pub fn new(connector: impl Connector) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            connector: Arc::new(connector),
            policy: ReconnectPolicy::default(),
            shared: Arc::new(Shared {
                link: Mutex::new(LinkState::default()),
                registry: Arc::new(Mutex::new(Registry::default())),
                connected,
            }),
            task: Mutex::new(None),
        }
    }

    /// A WebSocket channel configured from [`ClientConfig`].
    pub fn from_config(config: &ClientConfig) -> Self {
        let connector = WebSocketConnector::new(config.signaling.url.clone())
            .with_heartbeat_interval(config.signaling.heartbeat_interval());
        Self::new(connector).with_reconnect_policy(config.reconnect.policy())
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Spawn the background task that keeps a link up. Returns immediately.
    /// Calling it while already running is a no-op.
    pub fn connect(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            debug!("Signaling: already connecting");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.connector),
            self.policy.clone(),
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
    }

    /// Stop reconnecting and close the current link. Frames already queued
    /// on the link are still flushed by the transport.
    pub fn disconnect(&self) {
        if let Some((cancel, _)) = lock(&self.task).take() {
            cancel.cancel();
        }
        self.shared.detach_any();
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Follows link up/down transitions.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn current_room(&self) -> Option<RoomId> {
        lock(&self.shared.link).room.clone()
    }

    /// Join `room` and remember it for automatic re-joins.
    pub fn join_room(&self, room: &RoomId) {
        let mut state = lock(&self.shared.link);
        state.room = Some(room.clone());
        send_on(
            &state,
            &ClientMessage::JoinRoom {
                room_id: room.clone(),
            },
        );
    }

    /// Best-effort leave; also stops re-joining `room` on reconnect.
    pub fn leave_room(&self, room: &RoomId) {
        let mut state = lock(&self.shared.link);
        if state.room.as_ref() == Some(room) {
            state.room = None;
        }
        send_on(
            &state,
            &ClientMessage::LeaveRoom {
                room_id: room.clone(),
            },
        );
    }

    pub fn send_signal(&self, room: &RoomId, payload: SignalPayload) {
        self.shared.send(&ClientMessage::WebrtcSignal {
            room_id: room.clone(),
            signal: payload,
        });
    }

    pub fn send_video_toggle(&self, room: &RoomId, enabled: bool) {
        self.shared.send(&ClientMessage::VideoToggle {
            room_id: room.clone(),
            enabled,
        });
    }

    /// Register a handler for every inbound event.
    pub fn subscribe(
        &self,
        handler: impl Fn(&ChannelEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let live = Arc::new(AtomicBool::new(true));
        let guard = Arc::clone(&live);
        let handler: Handler = Arc::new(move |event: &ChannelEvent| {
            if guard.load(Ordering::Acquire) {
                handler(event);
            }
        });

        let mut registry = lock(&self.shared.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, handler));
        Subscription {
            id,
            live,
            registry: Arc::downgrade(&self.shared.registry),
        }
    }

    pub fn on_participant_joined(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if matches!(event, ChannelEvent::ParticipantJoined) {
                f();
            }
        })
    }

    pub fn on_participant_left(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if matches!(event, ChannelEvent::ParticipantLeft) {
                f();
            }
        })
    }

    pub fn on_signal(&self, f: impl Fn(SignalPayload) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let ChannelEvent::Signal(payload) = event {
                f(payload.clone());
            }
        })
    }

    pub fn on_video_toggle(&self, f: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if let ChannelEvent::VideoToggle(enabled) = event {
                f(*enabled);
            }
        })
    }

    /// Fires on every link established after the first. The room has
    /// already been re-joined by the time handlers run.
    pub fn on_reconnect(&self, f: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe(move |event| {
            if matches!(event, ChannelEvent::Reconnected) {
                f();
            }
        })
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.registry).handlers.len()
    }
}

impl SignalSink for SignalingChannel {
    fn send_signal(&self, room: &RoomId, payload: SignalPayload) {
        SignalingChannel::send_signal(self, room, payload);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some((cancel, _)) = lock(&self.task).take() {
            cancel.cancel();
        }
    }
}

/// Keep a link up until cancelled.
async fn run(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut attempts = 0u32;
    let mut established_before = false;

    loop {
        let link = tokio::select! {
            _ = cancel.cancelled() => break,
            link = connector.connect() => link,
        };

        match link {
            Ok(Link {
                outbound,
                mut inbound,
            }) => {
                attempts = 0;
                shared.attach(outbound.clone());
                info!("Signaling: connected");
                if established_before {
                    shared.dispatch(&ChannelEvent::Reconnected);
                }
                established_before = true;

                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => None,
                        frame = inbound.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    match serde_json::from_str::<ServerMessage>(&frame) {
                        Ok(msg) => {
                            trace!(?msg, "Signaling: received");
                            shared.dispatch(&ChannelEvent::from(msg));
                        }
                        Err(e) => warn!(error = %e, "Signaling: ignoring undecodable frame"),
                    }
                }

                shared.detach(&outbound);
                if cancel.is_cancelled() {
                    break;
                }
                warn!("Signaling: connection lost, reconnecting");
            }
            Err(e) => {
                attempts += 1;
                if policy.exhausted(attempts) {
                    error!("Signaling: max reconnect attempts reached: {e}");
                    break;
                }
                let delay = policy.delay_for(attempts);
                warn!("Signaling: connect failed ({e}), retrying in {delay:?} (attempt {attempts})");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("Signaling: connection task stopped");
}
