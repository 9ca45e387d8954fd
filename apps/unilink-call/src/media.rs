//! Local capture and track-level media control.
//!
//! Tracks are toggled through their enabled flag only; they are never stopped
//! or replaced while the call is alive, so muting never needs renegotiation.
//! The whole stream is stopped exactly once, when the session tears down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::MediaError;

pub const CAMERA_FALLBACK_WARNING: &str = "Camera is in use. Falling back to audio-only.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{}-{}", kind.as_str(), Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}

/// A captured local stream: one id, a handful of tracks.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: format!("local-{}", Uuid::new_v4()),
            tracks: tracks.into_iter().map(Arc::new).collect(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn from_constraints(constraints: MediaConstraints) -> Self {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video));
        }
        Self::new(tracks)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops every track. Returns `false` when the stream was already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.tracks {
            track.stop();
        }
        true
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub media: Arc<LocalMedia>,
    /// Set when capture succeeded only after dropping video.
    pub warning: Option<String>,
}

/// Requests `constraints`; a busy or unsatisfiable camera is retried once
/// without video instead of failing the whole call.
pub async fn acquire_local_media(
    devices: &dyn MediaDevices,
    constraints: MediaConstraints,
) -> Result<AcquiredMedia, MediaError> {
    match devices.get_user_media(constraints).await {
        Ok(media) => Ok(AcquiredMedia {
            media: Arc::new(media),
            warning: None,
        }),
        Err(err) if constraints.video && err.is_video_recoverable() => {
            tracing::warn!(error = %err, "camera unavailable, falling back to audio-only");
            let media = devices
                .get_user_media(MediaConstraints::audio_only())
                .await?;
            Ok(AcquiredMedia {
                media: Arc::new(media),
                warning: Some(CAMERA_FALLBACK_WARNING.to_string()),
            })
        }
        Err(err) => Err(err),
    }
}

/// Capture backend without hardware. Availability is configured up front.
/// Audio tracks carry Opus silence; video tracks are negotiated but send no
/// frames. Used by the CLI client.
#[derive(Debug, Clone)]
pub struct VirtualDevices {
    pub microphone: bool,
    pub camera: bool,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio && !self.microphone {
            return Err(MediaError::NotFound("audio".into()));
        }
        if constraints.video && !self.camera {
            return Err(MediaError::DeviceBusy("virtual camera disabled".into()));
        }
        Ok(LocalMedia::from_constraints(constraints))
    }
}

/// Summary of the held local stream for observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMediaSummary {
    pub stream_id: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Mute and camera switches over the currently held stream.
#[derive(Debug, Default)]
pub struct MediaControl {
    media: Option<Arc<LocalMedia>>,
}

impl MediaControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, media: Arc<LocalMedia>) {
        self.media = Some(media);
    }

    pub fn media(&self) -> Option<&Arc<LocalMedia>> {
        self.media.as_ref()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
    }

    /// Flips audio; `None` when there is no audio track to flip.
    pub fn toggle_mute(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_camera(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.tracks_of(kind).any(|t| t.is_enabled()))
    }

    /// Stops the held stream. Safe to call from every teardown path.
    pub fn release(&mut self) -> bool {
        match self.media.take() {
            Some(media) => media.stop(),
            None => false,
        }
    }

    pub fn summary(&self) -> LocalMediaSummary {
        match &self.media {
            Some(media) => LocalMediaSummary {
                stream_id: Some(media.stream_id().to_string()),
                has_audio: media.has(TrackKind::Audio),
                has_video: media.has(TrackKind::Video),
                audio_enabled: self.is_enabled(TrackKind::Audio),
                video_enabled: self.is_enabled(TrackKind::Video),
            },
            None => LocalMediaSummary::default(),
        }
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        let Some(media) = &self.media else {
            return;
        };
        for track in media.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let media = self.media.as_ref()?;
        if !media.has(kind) {
            return None;
        }
        let next = !self.is_enabled(kind);
        self.set_enabled(kind, next);
        Some(next)
    }
}
