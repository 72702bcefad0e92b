//! Voice host seam. The audio loop lives behind the trait; callers only see
//! connect/disconnect and short text events.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),
    #[error("voice session failed: {0}")]
    Session(String),
    #[error("voice session is not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStatus {
    Active,
    Inactive,
}

#[async_trait]
pub trait VoiceAssistant: Send + Sync {
    /// Opens the microphone and the streaming session. No-op when already connected.
    async fn connect(&self) -> Result<(), VoiceError>;
    /// Releases the microphone and audio output.
    async fn disconnect(&self);
    async fn send_context(&self, text: &str) -> Result<(), VoiceError>;
}

/// Text injected into the session for a game event.
pub fn game_event(text: &str) -> String {
    format!("[GAME EVENT]: {text}")
}

/// Connects and reports the outcome through `status` instead of failing.
pub async fn connect_with_status(
    assistant: &dyn VoiceAssistant,
    status: &mpsc::UnboundedSender<VoiceStatus>,
) -> VoiceStatus {
    let outcome = match assistant.connect().await {
        Ok(()) => {
            info!("voice assistant connected");
            VoiceStatus::Active
        }
        Err(err) => {
            warn!(error = %err, "voice assistant failed to connect");
            VoiceStatus::Inactive
        }
    };
    let _ = status.send(outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Scripted {
        mic_denied: bool,
        connected: Mutex<bool>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceAssistant for Scripted {
        async fn connect(&self) -> Result<(), VoiceError> {
            if self.mic_denied {
                return Err(VoiceError::Microphone("permission denied".into()));
            }
            *self.connected.lock() = true;
            Ok(())
        }

        async fn disconnect(&self) {
            *self.connected.lock() = false;
        }

        async fn send_context(&self, text: &str) -> Result<(), VoiceError> {
            if !*self.connected.lock() {
                return Err(VoiceError::NotConnected);
            }
            self.sent.lock().push(game_event(text));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_connect_reports_inactive() {
        let voice = Scripted {
            mic_denied: true,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(connect_with_status(&voice, &tx).await, VoiceStatus::Inactive);
        assert_eq!(rx.recv().await, Some(VoiceStatus::Inactive));
    }

    #[tokio::test]
    async fn context_goes_out_as_a_game_event() {
        let voice = Scripted::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connect_with_status(&voice, &tx).await;
        assert_eq!(rx.recv().await, Some(VoiceStatus::Active));

        voice.send_context("User scored 100").await.unwrap();
        assert_eq!(*voice.sent.lock(), vec!["[GAME EVENT]: User scored 100"]);

        voice.disconnect().await;
        assert_eq!(
            voice.send_context("late").await,
            Err(VoiceError::NotConnected)
        );
    }
}
