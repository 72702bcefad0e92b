use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalStream, MediaKind};

pub type PeerId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

/// Offer/answer body as carried in a signal payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Which side of the offer/answer exchange this entry plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Saw the remote `join` and sent the offer.
    Initiator,
    /// Received the offer and answered it.
    Responder,
}

/// Per-peer negotiation state. A peer with no registry entry is "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closed,
}

/// Transport-level state reported by a [`crate::peer::link::PeerLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Media received from one remote peer.
#[derive(Clone)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub kind: MediaKind,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind,
            track: None,
        }
    }

    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        Self {
            stream_id: track.stream_id(),
            kind,
            track: Some(track),
        }
    }

    /// The underlying RTP track, when backed by a real connection.
    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("rtp", &self.track.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StreamHandle {
    Local(LocalStream),
    Remote(RemoteMedia),
}

/// What the rendering surface gets for every participant tile.
#[derive(Debug, Clone)]
pub struct RemoteStreamHandle {
    pub id: PeerId,
    pub stream: StreamHandle,
    pub is_self: bool,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(RemoteMedia),
    StateChanged(LinkState),
}

/// Asynchronous notification from a link, tagged with the remote peer it belongs to.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer_id: PeerId,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn new(peer_id: impl Into<PeerId>, kind: LinkEventKind) -> Self {
        Self {
            peer_id: peer_id.into(),
            kind,
        }
    }
}
