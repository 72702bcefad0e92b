//! Narrow interfaces to the services around the room: image generation and
//! scoring, profile storage and the voice host.

pub mod generation;
pub mod profile;
pub mod voice;

pub use generation::{
    evaluate_or_neutral, Evaluation, GameMode, GenerationError, ImageGenerator, ImagePayload,
};
pub use profile::{AppTheme, JsonProfileStore, ProfileStore, Reward, UserProfile};
pub use voice::{connect_with_status, VoiceAssistant, VoiceError, VoiceStatus};
