//! Media seams: local device acquisition and display sinks
//!
//! Actual capture and rendering are external collaborators; the session
//! only drives them through these traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Device acquisition failures, classified the way the session reacts to
/// them: a missing device is surfaced to the user, a permission denial is
/// treated as the user cancelling the call.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no camera or microphone found")]
    NotFound,
    #[error("device access denied")]
    PermissionDenied,
    #[error("media failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Capture constraints requested from the media source.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoSize>,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoSize {
                width: 250,
                height: 250,
            }),
        }
    }
}

/// One local or remote media track.
///
/// The enabled flag is shared: clones of the track observe enable/disable
/// from any holder. Tracks acquired locally carry the transport-level
/// handle the peer connection attaches; remote placeholder tracks do not.
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    rtc: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        rtc: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc,
        }
    }

    /// Placeholder for a track received from the remote party.
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::new(id, kind, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        self.rtc.clone()
    }
}

/// A bundle of tracks, owned by the session once acquired and shared by
/// reference with the peer connection and a display sink.
#[derive(Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }
}

/// Local media acquisition.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Display surface for a media stream. Rendering is out of scope; the
/// production sink only logs attachment.
pub trait VideoSink: Send + Sync {
    fn attach(&self, stream: &MediaStream);
    fn detach(&self);
}

/// Sink that records attachment in the log, for headless runs.
pub struct LogSink {
    label: &'static str,
}

impl LogSink {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl VideoSink for LogSink {
    fn attach(&self, stream: &MediaStream) {
        info!("{}: attached stream ({} tracks)", self.label, stream.tracks().len());
    }

    fn detach(&self) {
        info!("{}: detached", self.label);
    }
}

/// Media source producing silent/blank tracks, so the demo client can drive
/// a real peer connection on machines without capture devices.
pub struct SyntheticSource;

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            let audio = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio0".to_owned(),
                "huddle".to_owned(),
            ));
            tracks.push(MediaTrack::new("audio0", TrackKind::Audio, Some(audio)));
        }
        if constraints.video.is_some() {
            let video = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video0".to_owned(),
                "huddle".to_owned(),
            ));
            tracks.push(MediaTrack::new("video0", TrackKind::Video, Some(video)));
        }
        Ok(MediaStream::new(tracks))
    }
}
