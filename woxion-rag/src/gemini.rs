//! Gemini embedding and generation backends over the Generative Language
//! REST API.
//!
//! This module is only available when the `gemini` feature is enabled.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{ConversationTurn, Role};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::{Generated, GenerationProvider};
use crate::http::{check_status, decode_error, send_error};

/// The default Generative Language API base URL.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";
const DEFAULT_GENERATION_MODEL: &str = "gemini-2.0-flash";
const PROVIDER: &str = "Gemini";

/// Intended use of an embedding, which Gemini uses to tune the vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Text that will be searched.
    RetrievalDocument,
    /// Text of a search query.
    RetrievalQuery,
    /// Symmetric similarity.
    SemanticSimilarity,
}

fn require_key(api_key: String) -> Result<String> {
    if api_key.is_empty() {
        return Err(RagError::config("api_key", "Gemini API key must not be empty"));
    }
    Ok(api_key)
}

fn model_url(base_url: &str, model: &str, method: &str) -> String {
    format!("{}/models/{model}:{method}", base_url.trim_end_matches('/'))
}

#[derive(Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [PartRef<'a>; 1],
}

#[derive(Serialize)]
struct PartRef<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: String,
    content: Content<'a>,
    task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Values,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Values>,
}

#[derive(Deserialize)]
struct Values {
    values: Vec<f32>,
}

/// An [`EmbeddingProvider`] backed by the Gemini embedding API.
///
/// # Configuration
///
/// - `task_type` – defaults to [`TaskType::RetrievalDocument`]. Override with
///   [`GeminiEmbeddingProvider::with_task_type`].
/// - `output_dimensionality` – optional truncation of the output vector.
///
/// # Example
///
/// ```rust,ignore
/// use woxion_rag::gemini::GeminiEmbeddingProvider;
///
/// let provider = GeminiEmbeddingProvider::new("your-api-key")?;
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct GeminiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    model_tag: String,
    task_type: TaskType,
    output_dimensionality: Option<usize>,
    dimensions: usize,
}

impl GeminiEmbeddingProvider {
    /// Default embedding dimensions for `gemini-embedding-001`.
    const DEFAULT_DIMENSIONS: usize = 3072;

    /// Create a new provider using the given API key and the default
    /// `gemini-embedding-001` model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let mut provider = Self {
            client: reqwest::Client::new(),
            api_key: require_key(api_key.into())?,
            base_url: GEMINI_BASE_URL.into(),
            model: DEFAULT_EMBEDDING_MODEL.into(),
            model_tag: String::new(),
            task_type: TaskType::RetrievalDocument,
            output_dimensionality: None,
            dimensions: Self::DEFAULT_DIMENSIONS,
        };
        provider.refresh_tag();
        Ok(provider)
    }

    /// Create a new provider using the `GOOGLE_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| RagError::config("GOOGLE_API_KEY", "environment variable not set"))?;
        Self::new(api_key)
    }

    /// Set the embedding model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.refresh_tag();
        self
    }

    /// Set the task type used for embedding requests.
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Set the output dimensionality (truncates the embedding vector).
    pub fn with_output_dimensionality(mut self, dims: usize) -> Self {
        self.output_dimensionality = Some(dims);
        self.dimensions = dims;
        self.refresh_tag();
        self
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn refresh_tag(&mut self) {
        self.model_tag = format!("gemini:{}@{}", self.model, self.dimensions);
    }

    fn request<'a>(&self, text: &'a str) -> EmbedRequest<'a> {
        EmbedRequest {
            model: format!("models/{}", self.model),
            content: Content { role: None, parts: [PartRef { text }] },
            task_type: self.task_type,
            output_dimensionality: self.output_dimensionality,
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<R> {
        let response = self
            .client
            .post(model_url(&self.base_url, &self.model, method))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        response.json().await.map_err(|e| decode_error(PROVIDER, e))
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(provider = PROVIDER, text_len = text.len(), "embedding single text");
        let response: EmbedResponse = self.post("embedContent", &self.request(text)).await?;
        Ok(response.embedding.values)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(provider = PROVIDER, batch_size = texts.len(), "embedding batch");
        let body = BatchEmbedRequest { requests: texts.iter().map(|t| self.request(t)).collect() };
        let response: BatchEmbedResponse = self.post("batchEmbedContents", &body).await?;
        Ok(response.embeddings.into_iter().map(|e| e.values).collect())
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

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    avg_logprobs: Option<f32>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

/// A [`GenerationProvider`] backed by the Gemini `generateContent` API.
///
/// History turns are sent first and the grounded prompt last, as the user
/// turn being answered. The confidence signal is derived from the
/// candidate's average log-probability when the API reports it.
pub struct GeminiGenerationProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiGenerationProvider {
    /// Create a new provider using the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            api_key: require_key(api_key.into())?,
            base_url: GEMINI_BASE_URL.into(),
            model: DEFAULT_GENERATION_MODEL.into(),
        })
    }

    /// Create a new provider using the `GOOGLE_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| RagError::config("GOOGLE_API_KEY", "environment variable not set"))?;
        Self::new(api_key)
    }

    /// Set the generation model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn contents<'a>(prompt: &'a str, history: &'a [ConversationTurn]) -> Vec<Content<'a>> {
    history
        .iter()
        .map(|turn| Content {
            role: Some(match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
            }),
            parts: [PartRef { text: &turn.content }],
        })
        .chain(std::iter::once(Content { role: Some("user"), parts: [PartRef { text: prompt }] }))
        .collect()
}

#[async_trait]
impl GenerationProvider for GeminiGenerationProvider {
    async fn generate(&self, prompt: &str, history: &[ConversationTurn]) -> Result<Generated> {
        debug!(
            provider = PROVIDER,
            model = %self.model,
            history = history.len(),
            "generate content"
        );

        let body = GenerateRequest { contents: contents(prompt, history) };
        let response = self
            .client
            .post(model_url(&self.base_url, &self.model, "generateContent"))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_status(PROVIDER, response).await?;
        let generated: GenerateResponse =
            response.json().await.map_err(|e| decode_error(PROVIDER, e))?;

        let candidate =
            generated.candidates.into_iter().next().ok_or_else(|| RagError::Backend {
                backend: PROVIDER.into(),
                message: "API returned no candidates".into(),
            })?;
        let text = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();

        Ok(Generated {
            text,
            confidence: candidate.avg_logprobs.map(|avg| avg.exp().clamp(0.0, 1.0)),
        })
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}
