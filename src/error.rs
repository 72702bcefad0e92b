use std::time::Duration;
use thiserror::Error;

/// Camera/microphone could not be opened. The only error surfaced to the player.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no {0} device available")]
    NoDevice(&'static str),
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid signaling channel name {0:?}")]
    InvalidChannel(String),
    #[error("signaling hub is closed")]
    HubClosed,
    #[error("a message handler is already registered on this channel")]
    HandlerAlreadyRegistered,
    #[error("signal encoding failed: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// A connection-establishment step failed. The entry is discarded, never retried.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("{step} failed: {reason}")]
    Step { step: &'static str, reason: String },
    #[error("signal from {peer_id} is missing its {expected} payload")]
    MissingPayload {
        peer_id: String,
        expected: &'static str,
    },
    #[error("peer link is closed")]
    Closed,
}

impl NegotiationError {
    pub fn step(step: &'static str, err: impl std::fmt::Display) -> Self {
        NegotiationError::Step {
            step,
            reason: err.to_string(),
        }
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Setup(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("signaling channel name cannot be empty")]
    EmptyChannelName,
    #[error("ICE server {id} has an empty url")]
    EmptyIceUrl { id: String },
    #[error("TURN server {id} requires username and credential")]
    MissingTurnCredentials { id: String },
    #[error("peer timeout {timeout:?} must exceed heartbeat interval {heartbeat:?}")]
    TimeoutTooShort { heartbeat: Duration, timeout: Duration },
}

/// Errors returned by [`crate::session::RoomSession`].
#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("room id cannot be empty")]
    EmptyRoomId,
}

pub type RoomResult<T> = Result<T, RoomError>;
