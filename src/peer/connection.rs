use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{IceServerConfig, RoomConfig, DEFAULT_STUN_URL};
use crate::error::NegotiationError;
use crate::logger::dump_selected_pair;
use crate::media::MediaTrack;
use crate::peer::link::{LinkEventSender, PeerFactory, PeerLink};
use crate::peer::types::{
    IceCandidate, LinkEvent, LinkEventKind, LinkState, PeerId, RemoteMedia, SdpKind,
    SessionDescription,
};
use crate::utils::add_ice_url_scheme;

/// Builds webrtc-rs peer connections sharing one media engine and ICE setup.
pub struct RtcPeerFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcPeerFactory {
    pub fn new(config: &RoomConfig) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config: rtc_config(&config.ice_servers),
        })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        install_handlers(&pc, remote_peer_id, events);
        debug!(peer_id = remote_peer_id, "rtc peer connection created");
        Ok(Arc::new(RtcPeerLink {
            remote_peer_id: remote_peer_id.to_owned(),
            pc,
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, peer_id: &str, events: LinkEventSender) {
    let tx = events.clone();
    let id = peer_id.to_owned();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let kind = match cand.map(|c| c.to_json()) {
            Some(Ok(init)) => Some(LinkEventKind::LocalCandidate(IceCandidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
            })),
            Some(Err(err)) => {
                warn!(peer_id = %id, error = %err, "could not serialize local candidate");
                None
            }
            // end of gathering
            None => Some(LinkEventKind::GatheringComplete),
        };
        if let Some(kind) = kind {
            let _ = tx.send(LinkEvent::new(id.clone(), kind));
        }
        Box::pin(async {})
    }));

    let id = peer_id.to_owned();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        trace!(peer_id = %id, ?state, "ICE gathering state");
        Box::pin(async {})
    }));

    let tx = events.clone();
    let id = peer_id.to_owned();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            debug!(peer_id = %id, kind = %track.kind(), ssrc = track.ssrc(), "remote track");
            let _ = tx.send(LinkEvent::new(
                id.clone(),
                LinkEventKind::RemoteTrack(RemoteMedia::from_track(track)),
            ));
            Box::pin(async {})
        },
    ));

    let tx = events;
    let id = peer_id.to_owned();
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        let state = link_state(st);
        debug!(peer_id = %id, ?st, "peer connection state changed");
        if matches!(state, LinkState::Disconnected | LinkState::Failed) {
            if let Some(pc) = weak.upgrade() {
                let id = id.clone();
                tokio::spawn(async move {
                    dump_selected_pair(&pc, &id, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = tx.send(LinkEvent::new(id.clone(), LinkEventKind::StateChanged(state)));
        Box::pin(async {})
    }));
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

/// ICE servers from the user's list; a public STUN server when the list is empty.
fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: vec![DEFAULT_STUN_URL.into()],
            ..Default::default()
        }]
    } else {
        ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub struct RtcPeerLink {
    remote_peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
    };
    rtc.map_err(|err| NegotiationError::step("parse_description", err))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => {
            return Err(NegotiationError::step(
                "describe",
                format!("unsupported sdp type {other}"),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtp_track())
            .await
            .map_err(|err| NegotiationError::step("add_track", err))?;

        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        trace!(peer_id = %self.remote_peer_id, track = track.id(), "local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::step("create_offer", err))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::step("create_answer", err))?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|err| NegotiationError::step("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|err| NegotiationError::step("set_remote_description", err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::step("add_ice_candidate", err))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        info!(peer_id = %self.remote_peer_id, "rtc peer connection closed");
        Ok(())
    }
}
