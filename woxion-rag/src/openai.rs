//! OpenAI-compatible embedding and chat backends.
//!
//! Works against the OpenAI API and any server exposing the same
//! `/v1/embeddings` and `/v1/chat/completions` endpoints (vLLM, Ollama,
//! LM Studio). This module is only available when the `openai` feature is
//! enabled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{ConversationTurn, Role};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::{Generated, GenerationProvider};
use crate::http::{check_status, decode_error, send_error};

/// The default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// The default model for OpenAI embeddings.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// The default dimensionality for `text-embedding-3-small`.
const DEFAULT_DIMENSIONS: usize = 1536;

/// The default chat model.
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

const PROVIDER: &str = "OpenAI";

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

fn require_key(api_key: String, base_url: &str) -> Result<String> {
    // self-hosted compatible servers usually run without authentication
    if api_key.is_empty() && base_url == OPENAI_BASE_URL {
        return Err(RagError::config("api_key", "OpenAI API key must not be empty"));
    }
    Ok(api_key)
}

/// An [`EmbeddingProvider`] backed by an OpenAI-compatible embeddings API.
///
/// # Configuration
///
/// - `model` – defaults to `text-embedding-3-small`.
/// - `dimensions` – optional Matryoshka dimension override.
/// - `base_url` – defaults to the OpenAI API; point it at a self-hosted
///   server to keep documents on premises.
///
/// # Example
///
/// ```rust,ignore
/// use woxion_rag::openai::OpenAIEmbeddingProvider;
///
/// let provider = OpenAIEmbeddingProvider::new("sk-...")?;
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    model_tag: String,
    dimensions: usize,
    /// If set, passed to the API for Matryoshka dimension truncation.
    request_dimensions: Option<usize>,
}

impl OpenAIEmbeddingProvider {
    /// Create a new provider with the given API key.
    ///
    /// Uses the default model (`text-embedding-3-small`) and dimensions (1536).
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::compatible(OPENAI_BASE_URL, api_key)
    }

    /// Create a provider for an OpenAI-compatible server at `base_url`.
    pub fn compatible(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let api_key = require_key(api_key.into(), &base_url)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model: DEFAULT_EMBEDDING_MODEL.into(),
            model_tag: format!("openai:{DEFAULT_EMBEDDING_MODEL}@{DEFAULT_DIMENSIONS}"),
            dimensions: DEFAULT_DIMENSIONS,
            request_dimensions: None,
        })
    }

    /// Create a new provider using the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::config("OPENAI_API_KEY", "environment variable not set")
        })?;
        Self::new(api_key)
    }

    /// Set the model name (e.g. `text-embedding-3-large`).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.refresh_tag();
        self
    }

    /// Set the output dimensions (Matryoshka support).
    ///
    /// When set, the API returns embeddings truncated to this size.
    /// This also updates the value returned by [`dimensions()`](EmbeddingProvider::dimensions).
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.request_dimensions = Some(dims);
        self.refresh_tag();
        self
    }

    fn refresh_tag(&mut self) {
        self.model_tag = format!("openai:{}@{}", self.model, self.dimensions);
    }
}

// ── OpenAI API request/response types ──────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    logprobs: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
    #[serde(default)]
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Vec<TokenLogprob>,
}

#[derive(Deserialize)]
struct TokenLogprob {
    logprob: f32,
}

// ── EmbeddingProvider implementation ───────────────────────────────

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(provider = PROVIDER, text_len = text.len(), "embedding single text");

        let results = self.embed_batch(&[text]).await?;
        results.into_iter().next().ok_or_else(|| RagError::Backend {
            backend: PROVIDER.into(),
            message: "API returned empty response".into(),
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = PROVIDER,
            batch_size = texts.len(),
            model = %self.model,
            "embedding batch"
        );

        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
            dimensions: self.request_dimensions,
        };

        let response = self
            .client
            .post(endpoint(&self.base_url, "embeddings"))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;

        let mut embedding_response: EmbeddingResponse =
            response.json().await.map_err(|e| decode_error(PROVIDER, e))?;
        embedding_response.data.sort_by_key(|d| d.index);

        Ok(embedding_response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_tag(&self) -> &str {
        &self.model_tag
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

/// A [`GenerationProvider`] backed by an OpenAI-compatible chat completions
/// API.
///
/// The prompt is sent as the system message, followed by the conversation
/// history. When `logprobs` is enabled the
/// confidence signal is the mean token probability of the reply.
pub struct OpenAIChatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    logprobs: bool,
}

impl OpenAIChatProvider {
    /// Create a new provider with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::compatible(OPENAI_BASE_URL, api_key)
    }

    /// Create a provider for an OpenAI-compatible server at `base_url`.
    pub fn compatible(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let api_key = require_key(api_key.into(), &base_url)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model: DEFAULT_CHAT_MODEL.into(),
            temperature: 0.2,
            logprobs: false,
        })
    }

    /// Set the chat model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Request token log-probabilities and derive a confidence signal.
    pub fn with_logprobs(mut self, enabled: bool) -> Self {
        self.logprobs = enabled;
        self
    }
}

fn mean_probability(tokens: &[TokenLogprob]) -> Option<f32> {
    if tokens.is_empty() {
        return None;
    }
    let mean = tokens.iter().map(|t| t.logprob).sum::<f32>() / tokens.len() as f32;
    Some(mean.exp().clamp(0.0, 1.0))
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    async fn generate(&self, prompt: &str, history: &[ConversationTurn]) -> Result<Generated> {
        debug!(
            provider = PROVIDER,
            model = %self.model,
            history = history.len(),
            "chat completion"
        );

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage { role: "system", content: prompt });
        messages.extend(history.iter().map(|turn| ChatMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &turn.content,
        }));
        let request_body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            logprobs: self.logprobs,
        };

        let response = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;

        let chat: ChatResponse = response.json().await.map_err(|e| decode_error(PROVIDER, e))?;
        let choice = chat.choices.into_iter().next().ok_or_else(|| RagError::Backend {
            backend: PROVIDER.into(),
            message: "API returned no choices".into(),
        })?;

        Ok(Generated {
            text: choice.message.content.unwrap_or_default(),
            confidence: choice.logprobs.and_then(|l| mean_probability(&l.content)),
        })
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoints_without_double_slashes() {
        assert_eq!(
            endpoint("http://localhost:8000/v1/", "embeddings"),
            "http://localhost:8000/v1/embeddings"
        );
        assert_eq!(
            endpoint(OPENAI_BASE_URL, "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn empty_key_only_rejected_for_openai() {
        assert!(OpenAIEmbeddingProvider::new("").is_err());
        assert!(OpenAIEmbeddingProvider::compatible("http://localhost:11434/v1", "").is_ok());
    }

    #[test]
    fn compatible_servers_keep_base_url_and_defaults() {
        let embedder = OpenAIEmbeddingProvider::compatible("http://vllm:8000/v1", "").unwrap();
        assert_eq!(embedder.base_url, "http://vllm:8000/v1");
        assert!(embedder.api_key.is_empty());
        assert_eq!(embedder.model_tag(), "openai:text-embedding-3-small@1536");

        let chat = OpenAIChatProvider::compatible("http://ollama:11434/v1", "local").unwrap();
        assert_eq!(chat.base_url, "http://ollama:11434/v1");
        assert_eq!(chat.api_key, "local");
        assert_eq!(chat.model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn model_tag_tracks_model_and_dimensions() {
        let provider = OpenAIEmbeddingProvider::new("sk-test")
            .unwrap()
            .with_model("text-embedding-3-large")
            .with_dimensions(256);
        assert_eq!(provider.model_tag(), "openai:text-embedding-3-large@256");
        assert_eq!(provider.dimensions(), 256);
    }

    #[test]
    fn logprobs_become_mean_probability() {
        let tokens = vec![TokenLogprob { logprob: 0.0 }, TokenLogprob { logprob: 0.0 }];
        assert_eq!(mean_probability(&tokens), Some(1.0));
        assert_eq!(mean_probability(&[]), None);
    }
}
