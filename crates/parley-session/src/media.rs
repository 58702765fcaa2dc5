use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
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

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }
}

/// The local stream: at most one audio and one video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: Vec::new(),
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Adds `track`, replacing nothing: returns `false` when a track of the
    /// same kind is already present.
    pub(crate) fn insert(&mut self, track: MediaTrack) -> bool {
        if self.track(track.kind).is_some() {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub(crate) fn take(&mut self, kind: TrackKind) -> Vec<MediaTrack> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            self.tracks.drain(..).partition(|track| track.kind == kind);
        self.tracks = kept;
        taken
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

/// What the local side currently knows about the peer's media.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: Option<String>,
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl RemoteMedia {
    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub(crate) fn set(&mut self, track: MediaTrack) {
        match track.kind {
            TrackKind::Audio => self.audio = Some(track),
            TrackKind::Video => self.video = Some(track),
        }
    }

    /// Clears one kind; returns whether anything was there.
    pub(crate) fn clear(&mut self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio.take().is_some(),
            TrackKind::Video => self.video.take().is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub fn only(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => Self {
                audio: true,
                video: false,
            },
            TrackKind::Video => Self {
                audio: false,
                video: true,
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("access to {0} devices was denied")]
    PermissionDenied(TrackKind),
    #[error("no {0} device available")]
    NoDevice(TrackKind),
    #[error("device failure: {0}")]
    Device(String),
}

/// Source of capture tracks. Requests may wait on the user indefinitely.
#[async_trait]
pub trait MediaDeviceProvider: Send + Sync {
    async fn request_tracks(&self, request: MediaRequest) -> Result<Vec<MediaTrack>, MediaError>;

    /// Stops capture for a track handed out by `request_tracks`.
    fn release(&self, track: &MediaTrack);
}

/// Hands out placeholder tracks without touching hardware.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    deny: AtomicBool,
    live: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Tracks handed out and not yet released.
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDeviceProvider for SyntheticDevices {
    async fn request_tracks(&self, request: MediaRequest) -> Result<Vec<MediaTrack>, MediaError> {
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "synthetic microphone"));
        }
        if request.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "synthetic camera"));
        }
        if self.deny.load(Ordering::SeqCst) {
            let kind = tracks.first().map(|t| t.kind).unwrap_or(TrackKind::Audio);
            return Err(MediaError::PermissionDenied(kind));
        }
        self.live.fetch_add(tracks.len(), Ordering::SeqCst);
        Ok(tracks)
    }

    fn release(&self, _track: &MediaTrack) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
