// Room configuration.
// Defaults mirror the browser client: one public STUN server, a shared
// `ai_quest_signaling` channel and a small 320x240 camera capture.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_CHANNEL_NAME: &str = "ai_quest_signaling";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// One ICE server entry as a user would type it in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    /// `stun` or `turn`
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            id: "default-stun".into(),
            kind: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyIceUrl {
                id: self.id.clone(),
            });
        }
        if self.kind == "turn" && (self.username.is_none() || self.credential.is_none()) {
            return Err(ConfigError::MissingTurnCredentials {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Camera/microphone request sent to [`crate::media::MediaDevices`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: 320,
            height: 240,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RoomConfig {
    pub channel_name: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
    /// Broadcast heartbeats and evict silent peers.
    pub liveness_enabled: bool,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub peer_timeout: Duration,
    /// Capacity of the room event broadcast.
    pub event_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.into(),
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_URL)],
            media: MediaConstraints::default(),
            liveness_enabled: true,
            heartbeat_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

impl RoomConfig {
    /// Defaults overridden by `QUEST_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(name) = env_string("QUEST_SIGNAL_CHANNEL") {
            config.channel_name = name;
        }
        if let Some(url) = env_string("QUEST_STUN_URL") {
            config.ice_servers = vec![IceServerConfig::stun(url)];
        }
        if let Some(ms) = env_millis("QUEST_HEARTBEAT_MS") {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = env_millis("QUEST_PEER_TIMEOUT_MS") {
            config.peer_timeout = ms;
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::EmptyChannelName);
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.liveness_enabled && self.peer_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutTooShort {
                heartbeat: self.heartbeat_interval,
                timeout: self.peer_timeout,
            });
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = env_string(key)?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring malformed duration override");
            None
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
