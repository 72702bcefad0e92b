//! The room controller one player holds: local media, room membership and the
//! background pump that runs negotiation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::error::{MediaAccessError, RoomError, RoomResult};
use crate::media::{LocalStream, MediaDevices, MediaKind};
use crate::peer::link::PeerFactory;
use crate::peer::negotiation::Negotiator;
use crate::peer::registry::PeerRegistry;
use crate::peer::types::{LinkEvent, PeerId, PeerState, RemoteStreamHandle, StreamHandle};
use crate::signaling::{SignalKind, SignalMessage, SignalReceiver, SignalingChannel, SignalingHub};
use crate::utils::random_id;

/// Why a peer's tile should go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    /// The peer sent `leave`.
    Left,
    /// Negotiation or the transport failed.
    Failed,
    /// No signal from the peer within the liveness timeout.
    TimedOut,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Stream(RemoteStreamHandle),
    PeerLeft {
        peer_id: PeerId,
        reason: DepartureReason,
    },
}

#[derive(Default)]
struct SessionState {
    room_id: Option<String>,
    local_stream: Option<LocalStream>,
    pump: Option<JoinHandle<()>>,
}

pub struct RoomSession {
    peer_id: PeerId,
    config: RoomConfig,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerFactory>,
    channel: Arc<SignalingChannel>,
    inbound: Arc<AsyncMutex<SignalReceiver>>,
    registry: Arc<AsyncMutex<PeerRegistry>>,
    events: broadcast::Sender<RoomEvent>,
    state: Mutex<SessionState>,
}

impl RoomSession {
    pub fn new(
        config: RoomConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerFactory>,
        hub: &Arc<SignalingHub>,
    ) -> RoomResult<Self> {
        config.validate()?;
        let channel = SignalingChannel::open(hub, &config.channel_name)?;
        let inbound = channel.on_message()?;
        // nothing is read until a room is joined
        channel.set_receiving(false);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let peer_id = random_id();
        info!(%peer_id, channel = %config.channel_name, "room session created");

        Ok(Self {
            peer_id,
            config,
            devices,
            factory,
            channel: Arc::new(channel),
            inbound: Arc::new(AsyncMutex::new(inbound)),
            registry: Arc::new(AsyncMutex::new(PeerRegistry::new())),
            events,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn current_room(&self) -> Option<String> {
        self.state.lock().room_id.clone()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.state.lock().local_stream.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.registry.lock().await.peer_ids()
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.registry.lock().await.state(peer_id)
    }

    /// Opens camera and microphone. The player's own tile is announced as a
    /// stream event with `is_self` set.
    pub async fn start_local_stream(&self) -> Result<LocalStream, MediaAccessError> {
        let stream = match self.devices.get_user_media(&self.config.media).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "could not access camera/microphone");
                return Err(err);
            }
        };

        let previous = self.state.lock().local_stream.replace(stream.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        let _ = self.events.send(RoomEvent::Stream(RemoteStreamHandle {
            id: self.peer_id.clone(),
            stream: StreamHandle::Local(stream.clone()),
            is_self: true,
        }));
        Ok(stream)
    }

    /// Enters `room_id` and announces this peer. Peers already in the room
    /// will offer; this side only answers.
    pub async fn join_room(&self, room_id: &str) -> RoomResult<()> {
        if room_id.trim().is_empty() {
            return Err(RoomError::EmptyRoomId);
        }
        if let Some(current) = self.current_room() {
            info!(from = %current, to = room_id, "switching rooms");
            self.depart(false).await;
        }

        let local_stream = self.local_stream();
        if local_stream.is_none() {
            warn!(room_id, "joining without local media, peers will get no tracks");
        }

        let dropped = self.inbound.lock().await.drain();
        if dropped > 0 {
            debug!(dropped, "discarded signals queued before join");
        }
        self.channel.set_receiving(true);

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            self.peer_id.clone(),
            room_id,
            self.channel.clone(),
            self.factory.clone(),
            local_stream,
            link_tx,
            self.events.clone(),
        );
        let liveness = self.config.liveness_enabled.then_some(Liveness {
            interval: self.config.heartbeat_interval,
            timeout: self.config.peer_timeout,
        });
        let pump = tokio::spawn(run_pump(Pump {
            negotiator,
            registry: self.registry.clone(),
            inbound: self.inbound.clone(),
            link_rx,
            liveness,
        }));

        {
            let mut state = self.state.lock();
            state.room_id = Some(room_id.to_owned());
            state.pump = Some(pump);
        }

        self.channel
            .send(&SignalMessage::new(SignalKind::Join, room_id, &self.peer_id));
        info!(room_id, peer_id = %self.peer_id, "joined room");
        Ok(())
    }

    /// Announces departure, closes every connection and releases local
    /// media. Safe to call any number of times.
    pub async fn leave_room(&self) {
        self.depart(true).await;
    }

    async fn depart(&self, release_media: bool) {
        let (room_id, pump, local_stream) = {
            let mut state = self.state.lock();
            let local_stream = if release_media {
                state.local_stream.take()
            } else {
                None
            };
            (state.room_id.take(), state.pump.take(), local_stream)
        };

        if let Some(room_id) = &room_id {
            self.channel
                .send(&SignalMessage::new(SignalKind::Leave, room_id, &self.peer_id));
        }
        self.channel.set_receiving(false);
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        self.inbound.lock().await.drain();

        let closed = self.registry.lock().await.close_all().await;
        if let Some(stream) = local_stream {
            stream.stop();
        }
        if let Some(room_id) = room_id {
            info!(%room_id, closed, "left room");
        }
    }

    pub fn toggle_audio(&self, enabled: bool) {
        self.toggle(MediaKind::Audio, enabled);
    }

    pub fn toggle_video(&self, enabled: bool) {
        self.toggle(MediaKind::Video, enabled);
    }

    fn toggle(&self, kind: MediaKind, enabled: bool) {
        match self.state.lock().local_stream.as_ref() {
            Some(stream) => stream.set_enabled(kind, enabled),
            None => debug!(%kind, enabled, "toggle ignored, no local stream"),
        }
    }
}

impl Drop for RoomSession {
    // No `leave` goes out here; the other side notices through liveness.
    // Links are still closed when a runtime is around to do it.
    fn drop(&mut self) {
        self.channel.set_receiving(false);
        if let Some(pump) = self.state.get_mut().pump.take() {
            pump.abort();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.registry.clone();
                runtime.spawn(async move {
                    let closed = registry.lock().await.close_all().await;
                    if closed > 0 {
                        debug!(closed, "closed links of dropped session");
                    }
                });
            }
            Err(_) => warn!(
                peer_id = %self.peer_id,
                "room session dropped outside a runtime, peer links left open"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    interval: Duration,
    timeout: Duration,
}

struct Pump {
    negotiator: Negotiator,
    registry: Arc<AsyncMutex<PeerRegistry>>,
    inbound: Arc<AsyncMutex<SignalReceiver>>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    liveness: Option<Liveness>,
}

/// Serializes every inbound signal, link event and liveness tick for one room.
async fn run_pump(pump: Pump) {
    let Pump {
        negotiator,
        registry,
        inbound,
        mut link_rx,
        liveness,
    } = pump;

    let mut inbound = inbound.lock().await;
    let period = liveness.map_or(Duration::from_secs(3600), |l| l.interval);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    debug!(room_id = negotiator.room_id(), "signaling channel detached, pump stopping");
                    break;
                };
                let mut registry = registry.lock().await;
                negotiator.handle_signal(&mut registry, msg).await;
            }
            Some(event) = link_rx.recv() => {
                let mut registry = registry.lock().await;
                negotiator.handle_link_event(&mut registry, event).await;
            }
            _ = ticker.tick(), if liveness.is_some() => {
                negotiator.send_heartbeat();
                if let Some(liveness) = liveness {
                    let mut registry = registry.lock().await;
                    negotiator
                        .evict_stale(&mut registry, Instant::now(), liveness.timeout)
                        .await;
                }
            }
        }
    }
}
