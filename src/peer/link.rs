use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::MediaTrack;
use crate::peer::types::{IceCandidate, LinkEvent, SessionDescription};

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One connection to one remote peer, as the negotiator drives it.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds links. Local candidates, remote tracks and state changes are
/// reported through `events`, tagged with `remote_peer_id`.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
