//! Local media capture.
//!
//! [`MediaCaptureGuard`] acquires one audio+video stream from the platform
//! device API, hands it to the local preview, and is the only owner allowed
//! to stop its tracks. Peer sessions borrow the same stream across rebuilds.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, DeviceError};

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single platform media track.
///
/// `set_enabled(false)` keeps the track alive but sends silence/black,
/// which is how mute and camera-off work without renegotiating.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// A cheaply clonable handle to a set of tracks.
///
/// Clones share the same underlying tracks. Two handles are equal when they
/// refer to the same stream id.
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Arc<[Arc<dyn MediaTrack>]>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks: tracks.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    fn stop_all(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Which tracks to request from the device API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Platform camera/microphone access.
///
/// May never resolve (a permission prompt left open); callers must not rely
/// on a timeout.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, DeviceError>;
}

/// The local self-view.
pub trait PreviewSink: Send + Sync {
    fn attach(&self, stream: &MediaStream);
}

/// Owns the local stream and the `muted` / `video_enabled` / `capture_error` state.
pub struct MediaCaptureGuard {
    devices: Arc<dyn MediaDevices>,
    preview: Arc<dyn PreviewSink>,
    stream: Option<MediaStream>,
    muted: bool,
    video_enabled: bool,
    capture_error: Option<CaptureError>,
}

impl MediaCaptureGuard {
    pub fn new(devices: Arc<dyn MediaDevices>, preview: Arc<dyn PreviewSink>) -> Self {
        Self {
            devices,
            preview,
            stream: None,
            muted: false,
            video_enabled: true,
            capture_error: None,
        }
    }

    /// Request audio and video. Failure is terminal for this attempt.
    ///
    /// Once a stream is held it is returned again instead of re-capturing.
    pub async fn acquire(&mut self) -> Result<MediaStream, CaptureError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }

        match self.devices.get_user_media(MediaConstraints::default()).await {
            Ok(stream) => {
                tracing::info!(
                    stream = %stream.id(),
                    tracks = stream.tracks().len(),
                    "Local media acquired"
                );
                self.capture_error = None;
                self.preview.attach(&stream);
                self.stream = Some(stream.clone());
                Ok(stream)
            }
            Err(err) => {
                let kind = CaptureError::classify(&err);
                tracing::warn!(error = %err, kind = ?kind, "Local media capture failed");
                self.capture_error = Some(kind);
                Err(kind)
            }
        }
    }

    /// Idempotent; only touches the already-acquired audio tracks.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(stream) = &self.stream {
            stream.set_enabled(TrackKind::Audio, !muted);
        }
    }

    /// Idempotent; only touches the already-acquired video tracks.
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(stream) = &self.stream {
            stream.set_enabled(TrackKind::Video, enabled);
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn capture_error(&self) -> Option<CaptureError> {
        self.capture_error
    }

    /// Stop every local track. The guard can acquire again afterwards.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
            tracing::debug!(stream = %stream.id(), "Local media released");
        }
    }
}

impl Drop for MediaCaptureGuard {
    fn drop(&mut self) {
        self.release();
    }
}
