pub mod connection;
pub mod ice;
pub mod link;
pub mod loopback;
pub mod negotiation;
pub mod registry;
pub mod types;

pub use connection::RtcPeerFactory;
pub use link::{LinkEventSender, PeerFactory, PeerLink};
pub use loopback::LoopbackFactory;
pub use registry::{PeerEntry, PeerRegistry};
pub use types::{
    IceCandidate, LinkEvent, LinkEventKind, LinkState, PeerId, PeerState, RemoteMedia,
    RemoteStreamHandle, Role, SessionDescription, StreamHandle,
};
