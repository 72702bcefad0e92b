//! Same-origin signaling: typed room messages fanned out over a named
//! broadcast channel. Delivery is best effort; receivers do all filtering.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::peer::types::{IceCandidate, PeerId, SessionDescription};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Join,
    Offer,
    Answer,
    Candidate,
    Leave,
    Heartbeat,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub room_id: String,
    /// Sender.
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignalPayload>,
    /// Sender wall clock, unix millis. Informational only.
    #[serde(default)]
    pub ts: i64,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, room_id: &str, peer_id: &str) -> Self {
        Self {
            kind,
            room_id: room_id.to_owned(),
            peer_id: peer_id.to_owned(),
            target_peer_id: None,
            payload: None,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to(mut self, target: &str) -> Self {
        self.target_peer_id = Some(target.to_owned());
        self
    }

    pub fn with_payload(mut self, payload: SignalPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Receiver-side filter: same room, not our own echo, and either
    /// untargeted or targeted at us.
    pub fn is_for(&self, local_room: Option<&str>, local_peer: &str) -> bool {
        if local_room != Some(self.room_id.as_str()) {
            return false;
        }
        if self.peer_id == local_peer {
            return false;
        }
        match &self.target_peer_id {
            Some(target) => target == local_peer,
            None => true,
        }
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            Some(SignalPayload::Description(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            Some(SignalPayload::Candidate(cand)) => Some(cand),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(raw)?)
    }
}

struct Endpoint {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<str>>,
    receiving: Arc<AtomicBool>,
}

/// Namespace of named channels shared by everything in one origin (process).
#[derive(Default)]
pub struct SignalingHub {
    channels: RwLock<HashMap<String, Vec<Endpoint>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

static GLOBAL_HUB: Lazy<Arc<SignalingHub>> = Lazy::new(SignalingHub::new);

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide hub, the analogue of a browser origin.
    pub fn global() -> Arc<Self> {
        GLOBAL_HUB.clone()
    }

    /// Detaches every endpoint; later `open` calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.channels.write().clear();
    }

    pub fn endpoint_count(&self, name: &str) -> usize {
        self.channels.read().get(name).map_or(0, Vec::len)
    }

    fn attach(
        &self,
        name: &str,
        receiving: Arc<AtomicBool>,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Arc<str>>), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::HubClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .write()
            .entry(name.to_owned())
            .or_default()
            .push(Endpoint { id, tx, receiving });
        Ok((id, rx))
    }

    fn detach(&self, name: &str, id: u64) {
        let mut channels = self.channels.write();
        if let Some(endpoints) = channels.get_mut(name) {
            endpoints.retain(|e| e.id != id);
            if endpoints.is_empty() {
                channels.remove(name);
            }
        }
    }

    fn publish(&self, name: &str, from: u64, frame: Arc<str>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let channels = self.channels.read();
            let Some(endpoints) = channels.get(name) else {
                return 0;
            };
            // registration order
            for endpoint in endpoints.iter().filter(|e| e.id != from) {
                if !endpoint.receiving.load(Ordering::Acquire) {
                    continue;
                }
                if endpoint.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(endpoint.id);
                }
            }
        }
        for id in dead {
            self.detach(name, id);
        }
        delivered
    }
}

/// One attachment to a named channel, like a `BroadcastChannel` instance.
/// Never receives its own messages.
pub struct SignalingChannel {
    hub: Arc<SignalingHub>,
    name: String,
    id: u64,
    receiving: Arc<AtomicBool>,
    inbound: Mutex<Option<SignalReceiver>>,
}

impl SignalingChannel {
    pub fn open(hub: &Arc<SignalingHub>, name: &str) -> Result<Self, TransportError> {
        if name.trim().is_empty() {
            return Err(TransportError::InvalidChannel(name.to_owned()));
        }
        let receiving = Arc::new(AtomicBool::new(true));
        let (id, rx) = hub.attach(name, receiving.clone())?;
        debug!(channel = name, endpoint = id, "signaling channel opened");
        Ok(Self {
            hub: hub.clone(),
            name: name.to_owned(),
            id,
            receiving,
            inbound: Mutex::new(Some(SignalReceiver { rx })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget broadcast to every other endpoint on this channel.
    pub fn send(&self, message: &SignalMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(channel = %self.name, kind = ?message.kind, error = %err, "dropping unencodable signal");
                return;
            }
        };
        let delivered = self.hub.publish(&self.name, self.id, Arc::from(frame));
        trace!(
            channel = %self.name,
            kind = ?message.kind,
            target = ?message.target_peer_id,
            delivered,
            "signal sent"
        );
    }

    /// While off, broadcasts skip this endpoint entirely and nothing queues
    /// up. Sending is unaffected.
    pub fn set_receiving(&self, on: bool) {
        if self.receiving.swap(on, Ordering::AcqRel) != on {
            debug!(channel = %self.name, endpoint = self.id, on, "inbound switched");
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Takes the single inbound stream of this endpoint.
    pub fn on_message(&self) -> Result<SignalReceiver, TransportError> {
        self.inbound
            .lock()
            .take()
            .ok_or(TransportError::HandlerAlreadyRegistered)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.hub.detach(&self.name, self.id);
        debug!(channel = %self.name, endpoint = self.id, "signaling channel closed");
    }
}

pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<Arc<str>>,
}

impl SignalReceiver {
    /// Next well-formed message; malformed frames are skipped. `None` once detached.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let frame = self.rx.recv().await?;
            if let Some(message) = Self::parse(&frame) {
                return Some(message);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        while let Ok(frame) = self.rx.try_recv() {
            if let Some(message) = Self::parse(&frame) {
                return Some(message);
            }
        }
        None
    }

    /// Discards everything queued so far.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    fn parse(frame: &str) -> Option<SignalMessage> {
        match SignalMessage::decode(frame) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "skipping malformed signal");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_browser_messages() {
        let msg = SignalMessage::new(SignalKind::Offer, "FunRoom", "a")
            .to("b")
            .with_payload(SignalPayload::Description(SessionDescription::offer("v=0")));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["roomId"], "FunRoom");
        assert_eq!(json["peerId"], "a");
        assert_eq!(json["targetPeerId"], "b");
        assert_eq!(json["payload"]["type"], "offer");

        let raw = r#"{"type":"candidate","roomId":"FunRoom","peerId":"a",
            "payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let parsed = SignalMessage::decode(raw).unwrap();
        assert_eq!(parsed.kind, SignalKind::Candidate);
        assert_eq!(parsed.candidate().unwrap().sdp_mid.as_deref(), Some("0"));
        assert!(parsed.description().is_none());
    }

    #[test]
    fn filter_rejects_other_rooms_self_and_foreign_targets() {
        let join = SignalMessage::new(SignalKind::Join, "FunRoom", "a");
        assert!(join.is_for(Some("FunRoom"), "b"));
        assert!(!join.is_for(Some("OtherRoom"), "b"));
        assert!(!join.is_for(None, "b"));
        assert!(!join.is_for(Some("FunRoom"), "a"));

        let targeted = join.clone().to("c");
        assert!(targeted.is_for(Some("FunRoom"), "c"));
        assert!(!targeted.is_for(Some("FunRoom"), "b"));
    }

    #[tokio::test]
    async fn fan_out_skips_sender_and_other_channels() {
        let hub = SignalingHub::new();
        let a = SignalingChannel::open(&hub, "quest").unwrap();
        let b = SignalingChannel::open(&hub, "quest").unwrap();
        let c = SignalingChannel::open(&hub, "quest").unwrap();
        let other = SignalingChannel::open(&hub, "elsewhere").unwrap();
        let mut a_rx = a.on_message().unwrap();
        let mut b_rx = b.on_message().unwrap();
        let mut c_rx = c.on_message().unwrap();
        let mut other_rx = other.on_message().unwrap();

        a.send(&SignalMessage::new(SignalKind::Join, "FunRoom", "a"));

        assert_eq!(b_rx.recv().await.unwrap().peer_id, "a");
        assert_eq!(c_rx.recv().await.unwrap().peer_id, "a");
        assert!(a_rx.try_recv().is_none());
        assert!(other_rx.try_recv().is_none());
    }

    #[test]
    fn handler_can_only_be_taken_once() {
        let hub = SignalingHub::new();
        let chan = SignalingChannel::open(&hub, "quest").unwrap();
        assert!(chan.on_message().is_ok());
        assert_eq!(
            chan.on_message().err(),
            Some(TransportError::HandlerAlreadyRegistered)
        );
    }

    #[test]
    fn open_fails_fast_without_attaching() {
        let hub = SignalingHub::new();
        assert!(matches!(
            SignalingChannel::open(&hub, "  "),
            Err(TransportError::InvalidChannel(_))
        ));
        assert_eq!(hub.endpoint_count("  "), 0);

        hub.close();
        assert_eq!(
            SignalingChannel::open(&hub, "quest").err(),
            Some(TransportError::HubClosed)
        );
        assert_eq!(hub.endpoint_count("quest"), 0);
    }

    #[tokio::test]
    async fn muted_endpoint_queues_nothing() {
        let hub = SignalingHub::new();
        let a = SignalingChannel::open(&hub, "quest").unwrap();
        let idle = SignalingChannel::open(&hub, "quest").unwrap();
        let mut idle_rx = idle.on_message().unwrap();

        idle.set_receiving(false);
        for _ in 0..1000 {
            a.send(&SignalMessage::new(SignalKind::Heartbeat, "OtherRoom", "a"));
        }
        assert_eq!(idle_rx.drain(), 0);
        assert_eq!(hub.endpoint_count("quest"), 2);

        idle.set_receiving(true);
        a.send(&SignalMessage::new(SignalKind::Join, "FunRoom", "a"));
        assert_eq!(idle_rx.recv().await.unwrap().kind, SignalKind::Join);
    }

    #[test]
    fn dropping_a_channel_detaches_it() {
        let hub = SignalingHub::new();
        let a = SignalingChannel::open(&hub, "quest").unwrap();
        {
            let _b = SignalingChannel::open(&hub, "quest").unwrap();
            assert_eq!(hub.endpoint_count("quest"), 2);
        }
        assert_eq!(hub.endpoint_count("quest"), 1);
        drop(a);
        assert_eq!(hub.endpoint_count("quest"), 0);
    }
}
