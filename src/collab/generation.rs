//! Image generation and submission scoring backend seam.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const FALLBACK_SCORE: u8 = 50;
pub const FALLBACK_FEEDBACK: &str = "Good effort! The AI is having trouble scoring right now.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Which game the submission belongs to; drives the scoring rubric.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    GuessPrompt,
    FixMistake,
    Emoji,
}

impl GameMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::GuessPrompt => "GUESS_PROMPT",
            GameMode::FixMistake => "FIX_MISTAKE",
            GameMode::Emoji => "EMOJI",
        }
    }

    /// Instruction sent to the scoring model.
    pub fn scoring_prompt(&self, target: &str, input: &str) -> String {
        match self {
            GameMode::GuessPrompt => format!(
                "Game: Guess the Prompt.\nOriginal Prompt: \"{target}\"\nUser Guess: \"{input}\"\n\
                 Task: Rate how close the user's guess is to the original prompt's meaning. \
                 Score from 0 to 100. Provide short, encouraging feedback for a child."
            ),
            GameMode::FixMistake => format!(
                "Game: Fix the AI Mistake.\nBroken Concept: \"{target}\"\nUser Fix: \"{input}\"\n\
                 Task: Did the user fix the logical error? Is it a better image prompt? \
                 Score from 0 to 100. Provide short feedback."
            ),
            GameMode::Emoji => format!(
                "Game: Emoji Challenge.\nEmojis provided: \"{target}\"\nUser Story/Prompt: \"{input}\"\n\
                 Task: Did the user incorporate the emojis creatively into a prompt? \
                 Score from 0 to 100 based on creativity and relevance. Provide short feedback."
            ),
        }
    }
}

/// Encoded image bytes, rendered as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime: String,
    pub data: Vec<u8>,
}

impl ImagePayload {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            mime: "image/png".into(),
            data,
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.data))
    }

    pub fn from_data_url(url: &str) -> Result<Self, GenerationError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| GenerationError::Malformed("not a data url".into()))?;
        let (mime, encoded) = rest
            .split_once(";base64,")
            .ok_or_else(|| GenerationError::Malformed("data url is not base64".into()))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|err| GenerationError::Malformed(err.to_string()))?;
        Ok(Self {
            mime: mime.to_owned(),
            data,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub score: u8,
    pub feedback: String,
}

impl Evaluation {
    /// Out-of-range scores are clamped to 0..=100.
    pub fn new(score: i64, feedback: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0, 100) as u8,
            feedback: feedback.into(),
        }
    }

    pub fn neutral() -> Self {
        Self::new(FALLBACK_SCORE.into(), FALLBACK_FEEDBACK)
    }

    /// Parses the model's `{"score": .., "feedback": ..}` reply. An empty
    /// reply counts as a zero score.
    pub fn parse(raw: &str) -> Result<Self, GenerationError> {
        #[derive(Deserialize)]
        struct Raw {
            score: i64,
            feedback: String,
        }

        if raw.trim().is_empty() {
            return Ok(Self::new(0, "Try again!"));
        }
        let parsed: Raw =
            serde_json::from_str(raw).map_err(|err| GenerationError::Malformed(err.to_string()))?;
        Ok(Self::new(parsed.score, parsed.feedback))
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<ImagePayload, GenerationError>;
    async fn random_prompt(&self) -> Result<String, GenerationError>;
    async fn evaluate(
        &self,
        mode: GameMode,
        target: &str,
        input: &str,
    ) -> Result<Evaluation, GenerationError>;
}

/// Scores a submission, substituting a neutral result when the backend fails.
pub async fn evaluate_or_neutral(
    generator: &dyn ImageGenerator,
    mode: GameMode,
    target: &str,
    input: &str,
) -> Evaluation {
    match generator.evaluate(mode, target, input).await {
        Ok(evaluation) => Evaluation::new(evaluation.score.into(), evaluation.feedback),
        Err(err) => {
            warn!(mode = mode.as_str(), error = %err, "evaluation failed, using neutral score");
            Evaluation::neutral()
        }
    }
}
