//! Local and remote media streams.
//!
//! The local stream is acquired once per session and shared (never copied)
//! by every peer connection. Only the session may stop its tracks, and only
//! on termination. Toggling a track flips its enabled flag in place without
//! renegotiation.
//!
//! A remote stream belongs to exactly one peer connection and is released
//! when that peer closes or fails.

use crate::errors::MediaError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus frame duration used by the synthetic microphone.
const SYNTHETIC_AUDIO_FRAME: Duration = Duration::from_millis(20);

/// A single Opus silence frame (TOC byte + 2 padding bytes).
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which devices to acquire.
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

/// One captured local track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    rtc_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create an enabled track of `kind` within stream `stream_id`.
    #[must_use]
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), Uuid::new_v4().simple());
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            id,
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            rtc_track,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// RTP sink shared with every peer transport.
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc_track)
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// The local participant's captured media.
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Create a stream with one track per requested kind.
    #[must_use]
    pub fn new(constraints: MediaConstraints) -> Self {
        let id = format!("local-{}", Uuid::new_v4().simple());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &id));
        }
        Self { id, tracks }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Flip every track of `kind`. Returns `false` if the stream has none.
    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind == kind && !t.is_stopped()) {
            track.set_enabled(enabled);
            found = true;
        }
        found
    }

    /// Whether any track of `kind` is enabled.
    #[must_use]
    pub fn is_kind_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind == kind && t.is_enabled())
    }

    /// Release every track. Only the owning session calls this.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        debug!(target: "cs.session", stream_id = %self.id, "Local tracks stopped");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Source of the local stream (camera/microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>, MediaError>;
}

/// Headless devices: the microphone produces Opus silence while enabled;
/// the camera produces no frames.
#[derive(Debug, Default, Clone)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".to_string(),
            ));
        }

        let stream = Arc::new(LocalStream::new(constraints));
        for track in stream.tracks().iter().filter(|t| t.kind == TrackKind::Audio) {
            tokio::spawn(pump_silence(track.clone()));
        }
        Ok(stream)
    }
}

async fn pump_silence(track: LocalTrack) {
    let mut ticker = tokio::time::interval(SYNTHETIC_AUDIO_FRAME);
    while !track.is_stopped() {
        ticker.tick().await;
        if !track.is_enabled() {
            continue;
        }
        let sample = Sample {
            data: Bytes::from_static(OPUS_SILENCE),
            duration: SYNTHETIC_AUDIO_FRAME,
            ..Default::default()
        };
        if let Err(e) = track.rtc_track.write_sample(&sample).await {
            warn!(target: "cs.session", track_id = %track.id, error = %e, "Synthetic audio write failed");
            break;
        }
    }
}

/// One frame taken from a remote video track.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCapture {
    /// Encoded frame bytes.
    pub data: Bytes,
    pub mime_type: String,
    /// Dimensions, when the bitstream carries them (VP8 keyframes).
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub captured_at: DateTime<Utc>,
}

impl ImageCapture {
    /// Wrap an assembled VP8 frame, reading dimensions from keyframe headers.
    #[must_use]
    pub fn from_vp8(data: Bytes) -> Self {
        let (width, height) = vp8_keyframe_dimensions(&data).unzip();
        Self {
            data,
            mime_type: MIME_TYPE_VP8.to_string(),
            width,
            height,
            captured_at: Utc::now(),
        }
    }
}

/// Width and height from a VP8 keyframe header (RFC 6386 section 9.1).
fn vp8_keyframe_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    let tag = *frame.first()?;
    if tag & 0x01 != 0 {
        return None;
    }
    if frame.get(3..6)? != [0x9d, 0x01, 0x2a] {
        return None;
    }
    let width = u16::from_le_bytes([*frame.get(6)?, *frame.get(7)?]) & 0x3fff;
    let height = u16::from_le_bytes([*frame.get(8)?, *frame.get(9)?]) & 0x3fff;
    Some((u32::from(width), u32::from(height)))
}

/// Writer side of a [`RemoteStream`], held by the media engine.
#[derive(Debug)]
pub struct RemoteStreamFeed {
    tracks: watch::Sender<Vec<TrackKind>>,
    frames: watch::Sender<Option<ImageCapture>>,
}

impl RemoteStreamFeed {
    pub fn add_track(&self, kind: TrackKind) {
        self.tracks.send_modify(|tracks| tracks.push(kind));
    }

    /// Replace the latest frame.
    pub fn push_frame(&self, frame: ImageCapture) {
        self.frames.send_replace(Some(frame));
    }
}

/// Media received from one remote participant.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: watch::Receiver<Vec<TrackKind>>,
    frames: watch::Receiver<Option<ImageCapture>>,
}

impl RemoteStream {
    /// Create a stream announced by its first track.
    #[must_use]
    pub fn new(id: impl Into<String>, first_track: TrackKind) -> (RemoteStreamFeed, Self) {
        let (tracks_tx, tracks_rx) = watch::channel(vec![first_track]);
        let (frames_tx, frames_rx) = watch::channel(None);
        (
            RemoteStreamFeed {
                tracks: tracks_tx,
                frames: frames_tx,
            },
            Self {
                id: id.into(),
                tracks: tracks_rx,
                frames: frames_rx,
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.borrow().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.borrow().is_empty()
    }

    /// Take the most recent frame.
    pub fn capture_frame(&self) -> Result<ImageCapture, MediaError> {
        self.frames.borrow().clone().ok_or(MediaError::NoFrame)
    }
}
