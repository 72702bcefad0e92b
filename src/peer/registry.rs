use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::peer::ice::PendingCandidates;
use crate::peer::link::PeerLink;
use crate::peer::types::{IceCandidate, PeerId, PeerState, Role};

/// Everything known about one remote peer.
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub role: Role,
    pub link: Arc<dyn PeerLink>,
    pub state: PeerState,
    pub pending: PendingCandidates,
    pub has_remote_description: bool,
    /// The stream handle for this peer has gone out.
    pub announced: bool,
    pub local_candidates: Vec<IceCandidate>,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn new(peer_id: impl Into<PeerId>, role: Role, link: Arc<dyn PeerLink>) -> Self {
        Self {
            peer_id: peer_id.into(),
            role,
            link,
            state: PeerState::Connecting,
            pending: PendingCandidates::default(),
            has_remote_description: false,
            announced: false,
            local_candidates: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    pub async fn close(&mut self) {
        self.state = PeerState::Closed;
        self.pending.clear();
        if let Err(err) = self.link.close().await {
            warn!(peer_id = %self.peer_id, error = %err, "peer link close failed");
        }
    }
}

/// Remote peer id → connection entry. At most one entry per peer.
#[derive(Default)]
pub struct PeerRegistry {
    entries: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.entries.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerEntry> {
        self.entries.get_mut(peer_id)
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.entries.get(peer_id).map(|e| e.state)
    }

    /// Returns `false` and leaves the existing entry alone if the peer is known.
    pub fn insert(&mut self, entry: PeerEntry) -> bool {
        if self.entries.contains_key(&entry.peer_id) {
            return false;
        }
        debug!(peer_id = %entry.peer_id, role = ?entry.role, "peer registered");
        self.entries.insert(entry.peer_id.clone(), entry);
        true
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerEntry> {
        self.entries.remove(peer_id)
    }

    /// Sorted, for stable output.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn touch(&mut self, peer_id: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.last_seen = now;
        }
    }

    /// Peers not heard from within `timeout` of `now`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .entries
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|e| e.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Closes and removes every entry.
    pub async fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.close().await;
        }
        if count > 0 {
            debug!(count, "closed all peer connections");
        }
        count
    }
}
