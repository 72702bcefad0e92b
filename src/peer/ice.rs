use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::logger::dump_candidate;
use crate::peer::link::PeerLink;
use crate::peer::types::IceCandidate;

/// Remote candidates received before the remote description, in arrival order.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn take(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Applies one remote candidate. A rejected candidate is logged and skipped;
/// other paths may still succeed.
pub async fn apply_candidate(link: &dyn PeerLink, peer_id: &str, candidate: IceCandidate) -> bool {
    dump_candidate("REMOTE", peer_id, &candidate);
    match link.add_ice_candidate(candidate).await {
        Ok(()) => true,
        Err(err) => {
            warn!(peer_id, error = %err, "failed to add ICE candidate");
            false
        }
    }
}

/// Flushes everything buffered while the remote description was missing.
pub async fn apply_pending_candidates(
    link: &dyn PeerLink,
    peer_id: &str,
    pending: &mut PendingCandidates,
) -> usize {
    let candidates = pending.take();
    if candidates.is_empty() {
        return 0;
    }
    debug!(peer_id, count = candidates.len(), "applying buffered candidates");
    let mut applied = 0;
    for candidate in candidates {
        if apply_candidate(link, peer_id, candidate).await {
            applied += 1;
        }
    }
    applied
}
