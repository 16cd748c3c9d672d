//! In-process fakes for the platform seams.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DeviceError, NegotiationError, SignalingError};
use crate::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, PreviewSink, TrackKind};
use crate::peer::{
    AttemptId, Cue, CuePlayer, NegotiationEvents, Negotiator, NegotiatorFactory,
    NegotiatorOptions, RemoteView,
};
use crate::room::RoomId;
use crate::signaling::{
    ClientMessage, Connector, Link, LinkEnd, ServerMessage, SignalPayload, SignalSink,
    SignalingChannel,
};

const WAIT: Duration = Duration::from_secs(5);

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("sender dropped")
}

pub async fn wait_connected(channel: &SignalingChannel) {
    let mut state = channel.connection_state();
    tokio::time::timeout(WAIT, state.wait_for(|up| *up))
        .await
        .expect("timed out waiting for connection")
        .expect("channel dropped");
}

// ── Media ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FakeTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// One audio and one video track.
pub fn fake_stream(id: &str) -> MediaStream {
    MediaStream::new(
        id,
        vec![
            Arc::new(FakeTrack::new(TrackKind::Audio)),
            Arc::new(FakeTrack::new(TrackKind::Video)),
        ],
    )
}

enum DeviceBehavior {
    Working,
    Failing(String),
    /// A permission prompt nobody answers.
    Hanging,
}

pub struct FakeDevices {
    behavior: DeviceBehavior,
    requests: Mutex<Vec<MediaConstraints>>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    fn with(behavior: DeviceBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn working() -> Self {
        Self::with(DeviceBehavior::Working)
    }

    pub fn failing(name: &str) -> Self {
        Self::with(DeviceBehavior::Failing(name.to_owned()))
    }

    pub fn hanging() -> Self {
        Self::with(DeviceBehavior::Hanging)
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    pub fn issued_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, DeviceError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(constraints);
            requests.len()
        };
        match &self.behavior {
            DeviceBehavior::Working => {
                let audio = Arc::new(FakeTrack::new(TrackKind::Audio));
                let video = Arc::new(FakeTrack::new(TrackKind::Video));
                self.issued
                    .lock()
                    .unwrap()
                    .extend([audio.clone(), video.clone()]);
                Ok(MediaStream::new(format!("local-{n}"), vec![audio, video]))
            }
            DeviceBehavior::Failing(name) => Err(DeviceError::new(name.clone(), "fake failure")),
            DeviceBehavior::Hanging => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingPreview {
    attached: Mutex<Vec<String>>,
}

impl RecordingPreview {
    pub fn attach_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

impl PreviewSink for RecordingPreview {
    fn attach(&self, stream: &MediaStream) {
        self.attached.lock().unwrap().push(stream.id().to_owned());
    }
}

// ── Peer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOp {
    Show(String),
    Clear,
}

#[derive(Default)]
pub struct RecordingRemoteView {
    ops: Mutex<Vec<ViewOp>>,
}

impl RecordingRemoteView {
    pub fn ops(&self) -> Vec<ViewOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl RemoteView for RecordingRemoteView {
    fn show(&self, stream: &MediaStream) {
        self.ops
            .lock()
            .unwrap()
            .push(ViewOp::Show(stream.id().to_owned()));
    }

    fn clear(&self) {
        self.ops.lock().unwrap().push(ViewOp::Clear);
    }
}

#[derive(Default)]
pub struct RecordingCues {
    played: Mutex<Vec<Cue>>,
    failing: AtomicBool,
}

impl RecordingCues {
    pub fn played(&self) -> Vec<Cue> {
        self.played.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CuePlayer for RecordingCues {
    fn play(&self, cue: Cue) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("autoplay blocked");
        }
        self.played.lock().unwrap().push(cue);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSignals {
    sent: Mutex<Vec<(RoomId, SignalPayload)>>,
}

impl RecordingSignals {
    pub fn sent(&self) -> Vec<(RoomId, SignalPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

impl SignalSink for RecordingSignals {
    fn send_signal(&self, room: &RoomId, payload: SignalPayload) {
        self.sent.lock().unwrap().push((room.clone(), payload));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorOp {
    Created {
        attempt: AttemptId,
    },
    Signaled {
        attempt: AttemptId,
        payload: SignalPayload,
    },
    Destroyed {
        attempt: AttemptId,
        listeners_attached: bool,
    },
}

#[derive(Default)]
struct MockState {
    log: Vec<NegotiatorOp>,
    options: Vec<NegotiatorOptions>,
    emitters: Vec<NegotiationEvents>,
}

/// Records every negotiator it builds and hands tests the event emitters.
#[derive(Default)]
pub struct MockNegotiators {
    state: Arc<Mutex<MockState>>,
    fail_creates: AtomicBool,
    reject_signals: Arc<AtomicBool>,
}

impl MockNegotiators {
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().options.len()
    }

    pub fn options(&self, index: usize) -> NegotiatorOptions {
        self.state.lock().unwrap().options[index].clone()
    }

    pub fn emitter(&self, index: usize) -> NegotiationEvents {
        self.state.lock().unwrap().emitters[index].clone()
    }

    pub fn log(&self) -> Vec<NegotiatorOp> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn reject_signals(&self, reject: bool) {
        self.reject_signals.store(reject, Ordering::SeqCst);
    }
}

impl NegotiatorFactory for MockNegotiators {
    fn create(
        &self,
        options: NegotiatorOptions,
        events: NegotiationEvents,
    ) -> Result<Box<dyn Negotiator>, NegotiationError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(NegotiationError::new("no ICE servers"));
        }
        let attempt = events.attempt();
        let mut state = self.state.lock().unwrap();
        state.log.push(NegotiatorOp::Created { attempt });
        state.options.push(options);
        state.emitters.push(events.clone());
        Ok(Box::new(MockNegotiator {
            attempt,
            events,
            destroyed: false,
            state: Arc::clone(&self.state),
            reject_signals: Arc::clone(&self.reject_signals),
        }))
    }
}

struct MockNegotiator {
    attempt: AttemptId,
    events: NegotiationEvents,
    destroyed: bool,
    state: Arc<Mutex<MockState>>,
    reject_signals: Arc<AtomicBool>,
}

impl Negotiator for MockNegotiator {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), NegotiationError> {
        if self.reject_signals.load(Ordering::SeqCst) {
            return Err(NegotiationError::new("malformed sdp"));
        }
        self.state.lock().unwrap().log.push(NegotiatorOp::Signaled {
            attempt: self.attempt,
            payload,
        });
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.state.lock().unwrap().log.push(NegotiatorOp::Destroyed {
            attempt: self.attempt,
            listeners_attached: self.events.is_attached(),
        });
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

// ── Signaling ──────────────────────────────────────────────────────────────

struct ConnectorInner {
    links_tx: mpsc::UnboundedSender<LinkEnd>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkEnd>>,
    attempts: AtomicU32,
    fail_remaining: AtomicU32,
}

/// Hands out in-memory links; the test plays the server through [`ServerEnd`].
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<ConnectorInner>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                links_tx,
                links_rx: tokio::sync::Mutex::new(links_rx),
                attempts: AtomicU32::new(0),
                fail_remaining: AtomicU32::new(0),
            }),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the client to open its next link.
    pub async fn next_link(&self) -> ServerEnd {
        let mut links = self.inner.links_rx.lock().await;
        let end = tokio::time::timeout(WAIT, links.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped");
        ServerEnd { end }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, SignalingError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SignalingError::Other("connection refused".into()));
        }
        let (link, end) = Link::channel();
        self.inner
            .links_tx
            .send(end)
            .map_err(|_| SignalingError::Other("no server".into()))?;
        Ok(link)
    }
}

/// The server side of one in-memory link. Dropping it closes the link.
pub struct ServerEnd {
    end: LinkEnd,
}

impl ServerEnd {
    pub async fn recv(&mut self) -> ClientMessage {
        let frame = tokio::time::timeout(WAIT, self.end.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link");
        serde_json::from_str(&frame).expect("client sent an undecodable frame")
    }

    /// Nothing further arrives for a short while.
    pub async fn assert_silent(&mut self) {
        if let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(100), self.end.from_client.recv()).await
        {
            panic!("unexpected client frame: {frame}");
        }
    }

    pub async fn assert_closed(&mut self) {
        match tokio::time::timeout(WAIT, self.end.from_client.recv()).await {
            Ok(None) => {}
            Ok(Some(frame)) => panic!("expected close, got frame: {frame}"),
            Err(_) => panic!("link was not closed"),
        }
    }

    /// Drain client frames until the link closes.
    pub async fn drain_until_closed(&mut self) -> Vec<ClientMessage> {
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, self.end.from_client.recv()).await {
                Ok(Some(frame)) => frames.push(
                    serde_json::from_str(&frame).expect("client sent an undecodable frame"),
                ),
                Ok(None) => return frames,
                Err(_) => panic!("link was not closed"),
            }
        }
    }

    pub fn push(&self, msg: &ServerMessage) {
        let frame = serde_json::to_string(msg).expect("encode server message");
        self.push_raw(&frame);
    }

    pub fn push_raw(&self, frame: &str) {
        self.end
            .to_client
            .send(frame.to_owned())
            .expect("client dropped the link");
    }
}
