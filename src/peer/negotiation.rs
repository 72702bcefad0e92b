//! Offer/answer/candidate exchange for one room.
//!
//! Roles are fixed by who saw whose `join`: the member already in the room
//! initiates towards the newcomer, the newcomer only ever answers. With `join`
//! broadcast once per room entry that yields exactly one offer per pair.
//!
//! Every handler takes the registry by `&mut`; the session's pump is the only
//! caller, so handlers for one peer never overlap.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::NegotiationError;
use crate::logger::{analyze_candidates, dump_candidate};
use crate::media::LocalStream;
use crate::peer::ice::{apply_candidate, apply_pending_candidates};
use crate::peer::link::{LinkEventSender, PeerFactory, PeerLink};
use crate::peer::registry::{PeerEntry, PeerRegistry};
use crate::peer::types::{
    LinkEvent, LinkEventKind, LinkState, PeerId, PeerState, RemoteStreamHandle, Role,
    StreamHandle,
};
use crate::session::{DepartureReason, RoomEvent};
use crate::signaling::{SignalKind, SignalMessage, SignalPayload, SignalingChannel};

pub struct Negotiator {
    local_peer_id: PeerId,
    room_id: String,
    channel: Arc<SignalingChannel>,
    factory: Arc<dyn PeerFactory>,
    local_stream: Option<LocalStream>,
    link_events: LinkEventSender,
    events: broadcast::Sender<RoomEvent>,
}

impl Negotiator {
    pub fn new(
        local_peer_id: impl Into<PeerId>,
        room_id: impl Into<String>,
        channel: Arc<SignalingChannel>,
        factory: Arc<dyn PeerFactory>,
        local_stream: Option<LocalStream>,
        link_events: LinkEventSender,
        events: broadcast::Sender<RoomEvent>,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            room_id: room_id.into(),
            channel,
            factory,
            local_stream,
            link_events,
            events,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn handle_signal(&self, registry: &mut PeerRegistry, msg: SignalMessage) {
        if !msg.is_for(Some(&self.room_id), &self.local_peer_id) {
            trace!(kind = ?msg.kind, from = %msg.peer_id, room = %msg.room_id, "signal filtered");
            return;
        }

        let from = msg.peer_id.clone();
        registry.touch(&from, Instant::now());

        let result = match msg.kind {
            SignalKind::Join => self.on_join(registry, &from).await,
            SignalKind::Offer => self.on_offer(registry, &from, &msg).await,
            SignalKind::Answer => self.on_answer(registry, &from, &msg).await,
            SignalKind::Candidate => {
                self.on_candidate(registry, &from, &msg).await;
                Ok(())
            }
            SignalKind::Leave => {
                self.remove_peer(registry, &from, DepartureReason::Left)
                    .await;
                Ok(())
            }
            SignalKind::Heartbeat => Ok(()),
        };

        if let Err(err) = result {
            warn!(peer_id = %from, kind = ?msg.kind, error = %err, "negotiation failed, dropping peer");
            self.remove_peer(registry, &from, DepartureReason::Failed)
                .await;
        }
    }

    pub async fn handle_link_event(&self, registry: &mut PeerRegistry, event: LinkEvent) {
        let peer_id = event.peer_id;
        let Some(entry) = registry.get_mut(&peer_id) else {
            trace!(%peer_id, kind = ?event.kind, "link event for departed peer ignored");
            return;
        };

        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &peer_id, &candidate);
                entry.local_candidates.push(candidate.clone());
                self.send_to(
                    &peer_id,
                    SignalKind::Candidate,
                    SignalPayload::Candidate(candidate),
                );
            }
            LinkEventKind::GatheringComplete => {
                analyze_candidates(&peer_id, &entry.local_candidates);
            }
            LinkEventKind::RemoteTrack(media) => {
                entry.state = PeerState::Connected;
                if entry.announced {
                    trace!(%peer_id, kind = %media.kind, "additional remote track");
                    return;
                }
                entry.announced = true;
                info!(%peer_id, stream = %media.stream_id, "remote stream arrived");
                let _ = self.events.send(RoomEvent::Stream(RemoteStreamHandle {
                    id: peer_id.clone(),
                    stream: StreamHandle::Remote(media),
                    is_self: false,
                }));
            }
            LinkEventKind::StateChanged(LinkState::Failed) => {
                warn!(%peer_id, "peer connection failed");
                self.remove_peer(registry, &peer_id, DepartureReason::Failed)
                    .await;
            }
            LinkEventKind::StateChanged(LinkState::Disconnected) => {
                warn!(%peer_id, "peer connection interrupted, waiting for ICE to recover");
            }
            LinkEventKind::StateChanged(state) => {
                debug!(%peer_id, ?state, "peer connection state");
            }
        }
    }

    /// Closes `peer_id`'s entry and announces the departure. Returns `false`
    /// when the peer was not registered.
    pub async fn remove_peer(
        &self,
        registry: &mut PeerRegistry,
        peer_id: &str,
        reason: DepartureReason,
    ) -> bool {
        let Some(mut entry) = registry.remove(peer_id) else {
            debug!(peer_id, ?reason, "departure for unknown peer ignored");
            return false;
        };
        entry.close().await;
        info!(peer_id, ?reason, "peer removed");
        let _ = self.events.send(RoomEvent::PeerLeft {
            peer_id: peer_id.to_owned(),
            reason,
        });
        true
    }

    pub async fn evict_stale(
        &self,
        registry: &mut PeerRegistry,
        now: Instant,
        timeout: Duration,
    ) -> Vec<PeerId> {
        let stale = registry.stale(now, timeout);
        for peer_id in &stale {
            warn!(%peer_id, ?timeout, "no signal from peer, evicting");
            self.remove_peer(registry, peer_id, DepartureReason::TimedOut)
                .await;
        }
        stale
    }

    pub fn send_heartbeat(&self) {
        self.channel.send(&SignalMessage::new(
            SignalKind::Heartbeat,
            &self.room_id,
            &self.local_peer_id,
        ));
    }

    async fn on_join(
        &self,
        registry: &mut PeerRegistry,
        from: &str,
    ) -> Result<(), NegotiationError> {
        if registry.contains(from) {
            debug!(peer_id = from, "join from known peer ignored");
            return Ok(());
        }
        let link = self.open_entry(registry, from, Role::Initiator).await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.send_to(from, SignalKind::Offer, SignalPayload::Description(offer));
        debug!(peer_id = from, "offer sent");
        Ok(())
    }

    async fn on_offer(
        &self,
        registry: &mut PeerRegistry,
        from: &str,
        msg: &SignalMessage,
    ) -> Result<(), NegotiationError> {
        let offer = msg
            .description()
            .cloned()
            .ok_or_else(|| NegotiationError::MissingPayload {
                peer_id: from.to_owned(),
                expected: "offer",
            })?;
        let link = match registry.get(from) {
            Some(entry) => entry.link.clone(),
            None => self.open_entry(registry, from, Role::Responder).await?,
        };
        link.set_remote_description(offer).await?;
        self.remote_description_applied(registry, from).await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.send_to(from, SignalKind::Answer, SignalPayload::Description(answer));
        debug!(peer_id = from, "answer sent");
        Ok(())
    }

    async fn on_answer(
        &self,
        registry: &mut PeerRegistry,
        from: &str,
        msg: &SignalMessage,
    ) -> Result<(), NegotiationError> {
        let Some(entry) = registry.get(from) else {
            debug!(peer_id = from, "answer from unknown peer dropped");
            return Ok(());
        };
        let answer = msg
            .description()
            .cloned()
            .ok_or_else(|| NegotiationError::MissingPayload {
                peer_id: from.to_owned(),
                expected: "answer",
            })?;
        let link = entry.link.clone();
        link.set_remote_description(answer).await?;
        self.remote_description_applied(registry, from).await;
        Ok(())
    }

    async fn on_candidate(&self, registry: &mut PeerRegistry, from: &str, msg: &SignalMessage) {
        let Some(entry) = registry.get_mut(from) else {
            debug!(peer_id = from, "candidate from unknown peer dropped");
            return;
        };
        let Some(candidate) = msg.candidate().cloned() else {
            warn!(peer_id = from, "candidate signal without payload");
            return;
        };
        if entry.has_remote_description {
            let link = entry.link.clone();
            apply_candidate(link.as_ref(), from, candidate).await;
        } else {
            entry.pending.push(candidate);
            debug!(
                peer_id = from,
                buffered = entry.pending.len(),
                "candidate buffered until remote description"
            );
        }
    }

    async fn remote_description_applied(&self, registry: &mut PeerRegistry, from: &str) {
        if let Some(entry) = registry.get_mut(from) {
            entry.has_remote_description = true;
            let link = entry.link.clone();
            apply_pending_candidates(link.as_ref(), from, &mut entry.pending).await;
        }
    }

    /// New link registered under `peer_id`, then every local track attached.
    /// The entry goes in first so teardown can always reach the link.
    async fn open_entry(
        &self,
        registry: &mut PeerRegistry,
        peer_id: &str,
        role: Role,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let link = self
            .factory
            .create_link(peer_id, self.link_events.clone())
            .await?;

        registry.insert(PeerEntry::new(peer_id, role, link.clone()));
        info!(peer_id, ?role, "peer connection created");

        if let Some(stream) = &self.local_stream {
            for track in stream.tracks() {
                link.add_track(track.clone()).await?;
            }
        }
        Ok(link)
    }

    fn send_to(&self, target: &str, kind: SignalKind, payload: SignalPayload) {
        self.channel.send(
            &SignalMessage::new(kind, &self.room_id, &self.local_peer_id)
                .to(target)
                .with_payload(payload),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::media::{MediaDevices, StaticDevices};
    use crate::peer::loopback::LoopbackFactory;
    use crate::peer::types::{IceCandidate, SessionDescription};
    use crate::signaling::{SignalReceiver, SignalingHub};
    use tokio::sync::mpsc;

    const ROOM: &str = "FunRoom";
    const ME: &str = "me";

    struct Harness {
        negotiator: Negotiator,
        registry: PeerRegistry,
        factory: Arc<LoopbackFactory>,
        wire: SignalReceiver,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        events: broadcast::Receiver<RoomEvent>,
        _observer: SignalingChannel,
    }

    impl Harness {
        async fn new(factory: Arc<LoopbackFactory>) -> Self {
            let hub = SignalingHub::new();
            let channel = Arc::new(SignalingChannel::open(&hub, "quest").unwrap());
            let observer = SignalingChannel::open(&hub, "quest").unwrap();
            let wire = observer.on_message().unwrap();
            let stream = StaticDevices::new()
                .get_user_media(&MediaConstraints::default())
                .await
                .unwrap();
            let (link_tx, link_rx) = mpsc::unbounded_channel();
            let (events_tx, events) = broadcast::channel(32);
            let negotiator = Negotiator::new(
                ME,
                ROOM,
                channel,
                factory.clone(),
                Some(stream),
                link_tx,
                events_tx,
            );
            Self {
                negotiator,
                registry: PeerRegistry::new(),
                factory,
                wire,
                link_rx,
                events,
                _observer: observer,
            }
        }

        async fn signal(&mut self, msg: SignalMessage) {
            self.negotiator.handle_signal(&mut self.registry, msg).await;
        }

        /// Feeds every queued link event back through the negotiator.
        async fn pump_links(&mut self) {
            while let Ok(event) = self.link_rx.try_recv() {
                self.negotiator
                    .handle_link_event(&mut self.registry, event)
                    .await;
            }
        }

        fn sent(&mut self) -> Vec<SignalMessage> {
            let mut out = Vec::new();
            while let Some(msg) = self.wire.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn from(kind: SignalKind, peer: &str) -> SignalMessage {
        SignalMessage::new(kind, ROOM, peer)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn each_join_creates_one_initiator_entry_and_offer() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        for peer in ["b", "c", "d"] {
            h.signal(from(SignalKind::Join, peer)).await;
        }
        h.signal(from(SignalKind::Join, "c")).await;

        assert_eq!(h.registry.len(), 3);
        for peer in ["b", "c", "d"] {
            let entry = h.registry.get(peer).unwrap();
            assert_eq!(entry.role, Role::Initiator);
            assert_eq!(entry.state, PeerState::Connecting);
        }

        let offers: Vec<_> = h
            .sent()
            .into_iter()
            .filter(|m| m.kind == SignalKind::Offer)
            .collect();
        assert_eq!(offers.len(), 3);
        assert!(offers.iter().all(|m| m.peer_id == ME && m.room_id == ROOM));
        let mut targets: Vec<_> = offers
            .iter()
            .map(|m| m.target_peer_id.clone().unwrap())
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn foreign_room_self_and_misaddressed_signals_are_ignored() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        let offer = SignalPayload::Description(SessionDescription::offer("v=0\r\n"));
        let kinds = [
            SignalKind::Join,
            SignalKind::Offer,
            SignalKind::Answer,
            SignalKind::Candidate,
            SignalKind::Leave,
            SignalKind::Heartbeat,
        ];
        for kind in kinds {
            h.signal(SignalMessage::new(kind, "OtherRoom", "b").with_payload(offer.clone()))
                .await;
            h.signal(SignalMessage::new(kind, ROOM, ME).with_payload(offer.clone()))
                .await;
            h.signal(
                SignalMessage::new(kind, ROOM, "b")
                    .to("someone-else")
                    .with_payload(offer.clone()),
            )
            .await;
        }
        assert!(h.registry.is_empty());
        assert!(h.sent().is_empty());
        assert!(h.factory.links().is_empty());
    }

    #[tokio::test]
    async fn offer_makes_a_responder_that_answers_without_offering() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        let remote = SessionDescription::offer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:remote-stream t1\r\n",
        );
        h.signal(
            from(SignalKind::Offer, "b")
                .to(ME)
                .with_payload(SignalPayload::Description(remote)),
        )
        .await;

        let entry = h.registry.get("b").unwrap();
        assert_eq!(entry.role, Role::Responder);
        assert!(entry.has_remote_description);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SignalKind::Answer);
        assert_eq!(sent[0].target_peer_id.as_deref(), Some("b"));

        let link = h.factory.link_to("b").unwrap();
        assert_eq!(link.offers_created(), 0);
        assert_eq!(link.answers_created(), 1);
        assert_eq!(link.tracks().len(), 2);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_leaves_registry_alone() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.signal(
            from(SignalKind::Candidate, "ghost")
                .to(ME)
                .with_payload(SignalPayload::Candidate(candidate(1))),
        )
        .await;
        h.signal(
            from(SignalKind::Answer, "ghost")
                .to(ME)
                .with_payload(SignalPayload::Description(SessionDescription::answer("v=0"))),
        )
        .await;
        assert_eq!(h.registry.peer_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_then_flushed_in_order() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        for n in 1..=3 {
            h.signal(
                from(SignalKind::Candidate, "b")
                    .to(ME)
                    .with_payload(SignalPayload::Candidate(candidate(n))),
            )
            .await;
        }
        assert_eq!(h.registry.get("b").unwrap().pending.len(), 3);
        let link = h.factory.link_to("b").unwrap();
        assert!(link.applied_candidates().is_empty());

        h.signal(
            from(SignalKind::Answer, "b")
                .to(ME)
                .with_payload(SignalPayload::Description(SessionDescription::answer(
                    "v=0\r\n",
                ))),
        )
        .await;
        assert!(h.registry.get("b").unwrap().pending.is_empty());

        h.signal(
            from(SignalKind::Candidate, "b")
                .to(ME)
                .with_payload(SignalPayload::Candidate(candidate(4))),
        )
        .await;
        let applied: Vec<_> = link
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        let expected: Vec<_> = (1..=4).map(|n| candidate(n).candidate).collect();
        assert_eq!(applied, expected);
    }

    #[tokio::test]
    async fn leave_closes_removes_and_notifies_once() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.signal(from(SignalKind::Leave, "b")).await;
        h.signal(from(SignalKind::Leave, "b")).await;

        assert!(h.registry.is_empty());
        assert!(h.factory.link_to("b").unwrap().is_closed());

        match h.events.try_recv().unwrap() {
            RoomEvent::PeerLeft { peer_id, reason } => {
                assert_eq!(peer_id, "b");
                assert_eq!(reason, DepartureReason::Left);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_stream_is_announced_once_per_peer() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.signal(
            from(SignalKind::Answer, "b")
                .to(ME)
                .with_payload(SignalPayload::Description(SessionDescription::answer(
                    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:sb ta\r\n\
                     m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:sb tv\r\n",
                ))),
        )
        .await;
        h.pump_links().await;
        h.factory.link_to("b").unwrap().repeat_remote_tracks();
        h.pump_links().await;

        assert_eq!(h.registry.state("b"), Some(PeerState::Connected));
        let mut streams = 0;
        while let Ok(event) = h.events.try_recv() {
            if let RoomEvent::Stream(handle) = event {
                assert_eq!(handle.id, "b");
                assert!(!handle.is_self);
                streams += 1;
            }
        }
        assert_eq!(streams, 1);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_to_their_peer() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.pump_links().await;

        let candidates: Vec<_> = h
            .sent()
            .into_iter()
            .filter(|m| m.kind == SignalKind::Candidate)
            .collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].target_peer_id.as_deref(), Some("b"));
        assert!(candidates[0].candidate().is_some());
        assert_eq!(h.registry.get("b").unwrap().local_candidates.len(), 1);
    }

    #[tokio::test]
    async fn failed_step_tears_the_entry_down_without_retry() {
        let mut h = Harness::new(LoopbackFactory::failing_at("create_offer")).await;
        h.signal(from(SignalKind::Join, "b")).await;

        assert!(h.registry.is_empty());
        assert!(h.factory.link_to("b").unwrap().is_closed());
        assert!(h.sent().is_empty());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            RoomEvent::PeerLeft {
                reason: DepartureReason::Failed,
                ..
            }
        ));
        assert_eq!(h.factory.links().len(), 1);
    }

    #[tokio::test]
    async fn track_attach_failure_still_closes_the_link() {
        let mut h = Harness::new(LoopbackFactory::failing_at("add_track")).await;
        h.signal(from(SignalKind::Join, "b")).await;

        assert!(h.registry.is_empty());
        assert!(h.factory.link_to("b").unwrap().is_closed());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            RoomEvent::PeerLeft {
                reason: DepartureReason::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn opened_entry_is_reachable_by_close_all() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.negotiator
            .open_entry(&mut h.registry, "b", Role::Initiator)
            .await
            .unwrap();
        assert!(h.registry.contains("b"));
        assert_eq!(h.factory.link_to("b").unwrap().tracks().len(), 2);

        assert_eq!(h.registry.close_all().await, 1);
        assert!(h.factory.link_to("b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn transport_failure_removes_the_peer() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.factory.link_to("b").unwrap().fail();
        h.pump_links().await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn silent_peers_are_evicted() {
        let mut h = Harness::new(LoopbackFactory::new()).await;
        h.signal(from(SignalKind::Join, "b")).await;
        h.signal(from(SignalKind::Join, "c")).await;

        let later = Instant::now() + Duration::from_secs(11);
        h.registry.touch("c", later);
        let evicted = h
            .negotiator
            .evict_stale(&mut h.registry, later, Duration::from_secs(10))
            .await;

        assert_eq!(evicted, vec!["b"]);
        assert_eq!(h.registry.peer_ids(), vec!["c"]);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            RoomEvent::PeerLeft {
                reason: DepartureReason::TimedOut,
                ..
            }
        ));
    }
}
