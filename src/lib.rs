//! Peer-to-peer video rooms for AI Quest.
//!
//! Every [`RoomSession`] talks to the others in its room over a same-origin
//! [`SignalingHub`] channel and keeps one peer link per remote member. Links
//! are built by a [`PeerFactory`]: [`RtcPeerFactory`] for real media,
//! [`LoopbackFactory`] for headless runs.

pub mod collab;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{IceServerConfig, MediaConstraints, RoomConfig};
pub use error::{ConfigError, MediaAccessError, NegotiationError, RoomError, RoomResult, TransportError};
pub use media::{LocalStream, MediaDevices, MediaKind, MediaTrack, SampleOutcome, StaticDevices};
pub use peer::{LoopbackFactory, PeerFactory, PeerLink, PeerState, RtcPeerFactory};
pub use session::{DepartureReason, RoomEvent, RoomSession};
pub use signaling::{SignalKind, SignalMessage, SignalingChannel, SignalingHub};
