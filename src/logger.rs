use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::DEFAULT_LOG_LEVEL;
use crate::peer::types::IceCandidate;

pub const LOG_FILTER_ENV: &str = "QUEST_LOG_FILTER";

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.into(),
            ansi: true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global fmt subscriber. Later calls are no-ops; concurrent
/// first calls wait for the one that installs it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    INIT.get_or_try_init(|| install(config)).map(|_| ())
}

fn install(config: &LogConfig) -> Result<(), InitError> {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(filter) if !filter.trim().is_empty() => EnvFilter::new(filter),
        // webrtc's ice/dtls internals are very chatty below warn
        _ => EnvFilter::new(format!(
            "{},webrtc=warn,webrtc_ice=warn,webrtc_dtls=warn,webrtc_mdns=warn",
            config.level
        )),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_target(true)
        .with_ansi(config.ansi)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))
}

/// Trickle-ICE trace of one candidate.
pub fn dump_candidate(label: &str, peer_id: &str, cand: &IceCandidate) {
    debug!(
        label,
        peer_id,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Logs the nominated candidate pair from `get_stats`.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, peer_id: &str, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    peer_id,
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

/// Counts candidate types and warns when no relay path exists.
pub fn analyze_candidates(peer_id: &str, candidates: &[IceCandidate]) {
    let mut host = 0;
    let mut srflx = 0;
    let mut relay = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay += 1;
        }
    }

    debug!(peer_id, host, srflx, relay, "candidate analysis");
    if relay == 0 && srflx == 0 && host > 0 {
        warn!(
            peer_id,
            "only host candidates gathered; peers behind NAT will not connect"
        );
    }
}
