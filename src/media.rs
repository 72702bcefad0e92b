//! Local capture: tracks shared by every peer link, and the device seam.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::MediaConstraints;
use crate::error::MediaAccessError;
use crate::utils::random_id;

/// Opus DTX frame decoders render as silence.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Result of pushing one encoded frame through a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Sent,
    /// Audio track disabled: a silence frame went out instead.
    Silenced,
    /// Video track disabled: nothing went out.
    Dropped,
    Stopped,
}

pub struct MediaTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Arc<Self> {
        let id = format!("{kind}-{}", random_id());
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));
        Arc::new(Self {
            id,
            stream_id: stream_id.to_owned(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    // Only the room session flips this; links just read samples.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// The RTP side handed to every peer connection.
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }

    /// Writes one encoded frame. A disabled track still writes (audio silence)
    /// or skips (video) so peers see the change without renegotiation.
    pub async fn write_sample(
        &self,
        data: Bytes,
        duration: Duration,
    ) -> Result<SampleOutcome, webrtc::Error> {
        if self.is_stopped() {
            return Ok(SampleOutcome::Stopped);
        }
        let (data, outcome) = match (self.is_enabled(), self.kind) {
            (true, _) => (data, SampleOutcome::Sent),
            (false, MediaKind::Audio) => (
                Bytes::from_static(&OPUS_SILENCE_FRAME),
                SampleOutcome::Silenced,
            ),
            (false, MediaKind::Video) => return Ok(SampleOutcome::Dropped),
        };
        self.rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(outcome)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// One capture session. Clones share the same tracks.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Arc<Vec<Arc<MediaTrack>>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub(crate) fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
        debug!(stream = %self.id, %kind, enabled, "local tracks toggled");
    }

    pub(crate) fn stop(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
        info!(stream = %self.id, "local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Camera/microphone access. Permission prompts may take arbitrarily long.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

/// Devices with a fixed answer to every permission prompt.
#[derive(Debug, Clone)]
pub struct StaticDevices {
    granted: bool,
    camera: bool,
    microphone: bool,
}

impl Default for StaticDevices {
    fn default() -> Self {
        Self {
            granted: true,
            camera: true,
            microphone: true,
        }
    }
}

impl StaticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            granted: false,
            ..Self::default()
        }
    }

    pub fn without_camera() -> Self {
        Self {
            camera: false,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaDevices for StaticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if !self.granted {
            return Err(MediaAccessError::PermissionDenied);
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaAccessError::Capture(
                "neither audio nor video requested".into(),
            ));
        }
        if constraints.video && !self.camera {
            return Err(MediaAccessError::NoDevice("camera"));
        }
        if constraints.audio && !self.microphone {
            return Err(MediaAccessError::NoDevice("microphone"));
        }

        let stream_id = random_id();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(MediaKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(MediaKind::Video, &stream_id));
        }
        info!(
            stream = %stream_id,
            width = constraints.width,
            height = constraints.height,
            tracks = tracks.len(),
            "local media opened"
        );
        Ok(LocalStream::new(stream_id, tracks))
    }
}
