//! Generation provider trait for producing answers from a grounded prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::ConversationTurn;
use crate::error::Result;

/// Text produced by a [`GenerationProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    /// The generated answer.
    pub text: String,
    /// Backend-reported confidence in `[0, 1]`, when the backend exposes one
    /// (for example derived from token log-probabilities).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Generated {
    /// Generated text without a confidence signal.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), confidence: None }
    }
}

/// A backend that turns a prompt and prior conversation into answer text.
///
/// The prompt already contains the system instructions, numbered context
/// passages and the user's question; `history` carries earlier turns of the
/// same conversation, oldest first.
///
/// Failures that may succeed on retry must be reported as
/// [`RagError::UpstreamUnavailable`](crate::RagError::UpstreamUnavailable).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate a response.
    async fn generate(&self, prompt: &str, history: &[ConversationTurn]) -> Result<Generated>;

    /// Backend name used in logs and errors.
    fn name(&self) -> &str {
        "generation"
    }
}
