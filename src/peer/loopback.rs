//! In-process [`PeerFactory`] for headless runs and tests. Links speak a
//! minimal SDP (one `m=` line plus `a=msid` per track), report a single host
//! candidate once a local description is set, and surface remote tracks as
//! soon as the remote description arrives. No packets ever move.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::NegotiationError;
use crate::media::{MediaKind, MediaTrack};
use crate::peer::link::{LinkEventSender, PeerFactory, PeerLink};
use crate::peer::types::{
    IceCandidate, LinkEvent, LinkEventKind, LinkState, PeerId, RemoteMedia, SessionDescription,
};
use crate::utils::random_id;

#[derive(Default)]
pub struct LoopbackFactory {
    fail_step: Option<&'static str>,
    links: Mutex<Vec<Arc<LoopbackLink>>>,
}

impl LoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every link built by this factory fails the named step
    /// (`create_link`, `create_offer`, `set_remote_description`, ...).
    pub fn failing_at(step: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fail_step: Some(step),
            ..Self::default()
        })
    }

    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        self.links.lock().clone()
    }

    /// Most recent link towards `remote_peer_id`.
    pub fn link_to(&self, remote_peer_id: &str) -> Option<Arc<LoopbackLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| l.remote_peer_id == remote_peer_id)
            .cloned()
    }
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        if self.fail_step == Some("create_link") {
            return Err(NegotiationError::Setup("injected failure".into()));
        }
        let link = Arc::new(LoopbackLink {
            remote_peer_id: remote_peer_id.to_owned(),
            session_id: random_id(),
            events,
            fail_step: self.fail_step,
            inner: Mutex::new(LinkInner::default()),
            closed: AtomicBool::new(false),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

#[derive(Default)]
struct LinkInner {
    tracks: Vec<Arc<MediaTrack>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    offers: usize,
    answers: usize,
    gathered: bool,
    connected: bool,
}

pub struct LoopbackLink {
    remote_peer_id: PeerId,
    session_id: String,
    events: LinkEventSender,
    fail_step: Option<&'static str>,
    inner: Mutex<LinkInner>,
    closed: AtomicBool,
}

impl LoopbackLink {
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.inner.lock().tracks.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.inner.lock().offers
    }

    pub fn answers_created(&self) -> usize {
        self.inner.lock().answers
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reports an ICE failure, as a real stack would after losing every path.
    pub fn fail(&self) {
        self.emit(LinkEventKind::StateChanged(LinkState::Failed));
    }

    /// Delivers one more remote track event for an already described stream.
    pub fn repeat_remote_tracks(&self) {
        let remote = self.inner.lock().remote.clone();
        if let Some(remote) = remote {
            for media in parse_media(&remote.sdp) {
                self.emit(LinkEventKind::RemoteTrack(media));
            }
        }
    }

    fn check(&self, step: &'static str) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if self.fail_step == Some(step) {
            return Err(NegotiationError::step(step, "injected failure"));
        }
        Ok(())
    }

    fn emit(&self, kind: LinkEventKind) {
        trace!(peer_id = %self.remote_peer_id, ?kind, "loopback event");
        let _ = self.events.send(LinkEvent::new(self.remote_peer_id.clone(), kind));
    }

    fn describe(&self, tracks: &[Arc<MediaTrack>]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id
        );
        for track in tracks {
            let (media, pt) = match track.kind() {
                MediaKind::Audio => ("audio", 111),
                MediaKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {pt}\r\na=msid:{} {}\r\n",
                track.stream_id(),
                track.id()
            ));
        }
        sdp
    }

    fn maybe_connected(&self) {
        let now_connected = {
            let mut inner = self.inner.lock();
            let ready = inner.local.is_some() && inner.remote.is_some() && !inner.connected;
            if ready {
                inner.connected = true;
            }
            ready
        };
        if now_connected {
            self.emit(LinkEventKind::StateChanged(LinkState::Connected));
        }
    }
}

fn parse_media(sdp: &str) -> Vec<RemoteMedia> {
    let mut media = Vec::new();
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            kind = match rest.split_whitespace().next() {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            };
        } else if let Some(rest) = line.strip_prefix("a=msid:") {
            if let (Some(kind), Some(stream)) = (kind, rest.split_whitespace().next()) {
                media.push(RemoteMedia::new(stream, kind));
            }
        }
    }
    media
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        self.check("add_track")?;
        self.inner.lock().tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check("create_offer")?;
        let mut inner = self.inner.lock();
        inner.offers += 1;
        Ok(SessionDescription::offer(self.describe(&inner.tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check("create_answer")?;
        let mut inner = self.inner.lock();
        if inner.remote.is_none() {
            return Err(NegotiationError::step(
                "create_answer",
                "no remote offer to answer",
            ));
        }
        inner.answers += 1;
        Ok(SessionDescription::answer(self.describe(&inner.tracks)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check("set_local_description")?;
        let first_gather = {
            let mut inner = self.inner.lock();
            inner.local = Some(desc);
            !std::mem::replace(&mut inner.gathered, true)
        };
        if first_gather {
            let port = 50000 + (rand::random::<u16>() % 10000);
            self.emit(LinkEventKind::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
            self.emit(LinkEventKind::GatheringComplete);
        }
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check("set_remote_description")?;
        if !desc.sdp.starts_with("v=0") {
            return Err(NegotiationError::step(
                "set_remote_description",
                "malformed sdp",
            ));
        }
        let media = parse_media(&desc.sdp);
        self.inner.lock().remote = Some(desc);
        for item in media {
            self.emit(LinkEventKind::RemoteTrack(item));
        }
        self.maybe_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.check("add_ice_candidate")?;
        let mut inner = self.inner.lock();
        if inner.remote.is_none() {
            return Err(NegotiationError::step(
                "add_ice_candidate",
                "remote description not set",
            ));
        }
        inner.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.emit(LinkEventKind::StateChanged(LinkState::Closed));
        Ok(())
    }
}
