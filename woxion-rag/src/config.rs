//! Configuration for the RAG pipeline.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

/// System prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are WoxionChat, an enterprise support assistant. \
Answer the user's question using the numbered context passages. \
Cite the passages you rely on with their [n] markers. \
If the passages do not contain the answer, say that you could not find it in the documents.";

/// How chunks are cut from document text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk.
    pub max_tokens: usize,
    /// Tokens copied from the end of one chunk to the start of the next.
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 256, overlap_tokens: 32 }
    }
}

/// How candidates are selected for a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Number of chunks returned to the synthesizer.
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to count as grounding.
    pub min_score: f32,
    /// Chunks of the same document closer than this many characters are
    /// treated as duplicates. Zero collapses only overlapping or touching chunks.
    pub dedup_char_distance: usize,
    /// Candidates fetched from the index per requested result.
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 5, min_score: 0.3, dedup_char_distance: 0, candidate_multiplier: 4 }
    }
}

/// What the synthesizer does when retrieval found nothing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UngroundedPolicy {
    /// Ask the generation backend anyway and flag the answer as ungrounded.
    #[default]
    Answer,
    /// Return an empty, ungrounded answer without calling the backend.
    Refuse,
}

/// How prompts are assembled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisConfig {
    /// Token budget for the whole prompt (system, history, context, query).
    pub context_budget_tokens: usize,
    /// Instructions placed at the top of every prompt.
    pub system_prompt: String,
    /// Most recent conversation turns forwarded to the backend.
    pub max_history_turns: usize,
    /// Behaviour when no context is available.
    pub ungrounded_policy: UngroundedPolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: 3000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history_turns: 20,
            ungrounded_policy: UngroundedPolicy::Answer,
        }
    }
}

/// Timeouts and retries for embedding and generation calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000, retry: RetryPolicy::default() }
    }
}

impl BackendConfig {
    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration parameters for the RAG pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    /// Chunking parameters.
    pub chunking: ChunkingConfig,
    /// Retrieval parameters.
    pub retrieval: RetrievalConfig,
    /// Prompt assembly parameters.
    pub synthesis: SynthesisConfig,
    /// Backend call parameters.
    pub backend: BackendConfig,
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Read overrides from `WOXION_RAG_*` environment variables on top of the
    /// defaults, then validate.
    ///
    /// Recognised variables: `WOXION_RAG_MAX_TOKENS`, `WOXION_RAG_OVERLAP_TOKENS`,
    /// `WOXION_RAG_TOP_K`, `WOXION_RAG_MIN_SCORE`, `WOXION_RAG_DEDUP_DISTANCE`,
    /// `WOXION_RAG_CONTEXT_BUDGET`, `WOXION_RAG_MAX_HISTORY_TURNS`,
    /// `WOXION_RAG_TIMEOUT_MS`, `WOXION_RAG_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](RagConfig::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let c = &mut config;
        read_var(&lookup, "WOXION_RAG_MAX_TOKENS", &mut c.chunking.max_tokens)?;
        read_var(&lookup, "WOXION_RAG_OVERLAP_TOKENS", &mut c.chunking.overlap_tokens)?;
        read_var(&lookup, "WOXION_RAG_TOP_K", &mut c.retrieval.top_k)?;
        read_var(&lookup, "WOXION_RAG_MIN_SCORE", &mut c.retrieval.min_score)?;
        read_var(&lookup, "WOXION_RAG_DEDUP_DISTANCE", &mut c.retrieval.dedup_char_distance)?;
        read_var(&lookup, "WOXION_RAG_CONTEXT_BUDGET", &mut c.synthesis.context_budget_tokens)?;
        read_var(&lookup, "WOXION_RAG_MAX_HISTORY_TURNS", &mut c.synthesis.max_history_turns)?;
        read_var(&lookup, "WOXION_RAG_TIMEOUT_MS", &mut c.backend.timeout_ms)?;
        read_var(&lookup, "WOXION_RAG_MAX_ATTEMPTS", &mut c.backend.retry.max_attempts)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] naming the first offending parameter.
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.max_tokens == 0 {
            return Err(RagError::config("max_tokens", "must be greater than zero"));
        }
        if chunking.overlap_tokens >= chunking.max_tokens {
            return Err(RagError::config(
                "overlap_tokens",
                format!(
                    "overlap_tokens ({}) must be less than max_tokens ({})",
                    chunking.overlap_tokens, chunking.max_tokens
                ),
            ));
        }
        let retrieval = &self.retrieval;
        if retrieval.top_k == 0 {
            return Err(RagError::config("top_k", "must be greater than zero"));
        }
        if !(-1.0..=1.0).contains(&retrieval.min_score) {
            return Err(RagError::config(
                "min_score",
                format!("{} is outside [-1, 1]", retrieval.min_score),
            ));
        }
        if retrieval.candidate_multiplier == 0 {
            return Err(RagError::config("candidate_multiplier", "must be at least 1"));
        }
        if self.synthesis.context_budget_tokens == 0 {
            return Err(RagError::config("context_budget_tokens", "must be greater than zero"));
        }
        if self.backend.timeout_ms == 0 {
            return Err(RagError::config("timeout_ms", "must be greater than zero"));
        }
        self.backend.retry.validate()
    }
}

pub(crate) fn read_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| RagError::config(key, format!("cannot parse '{raw}': {e}")))?;
    }
    Ok(())
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the maximum tokens per chunk.
    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.config.chunking.max_tokens = tokens;
        self
    }

    /// Set the overlap between consecutive chunks in tokens.
    pub fn overlap_tokens(mut self, tokens: usize) -> Self {
        self.config.chunking.overlap_tokens = tokens;
        self
    }

    /// Set the number of results handed to the synthesizer.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.retrieval.top_k = k;
        self
    }

    /// Set the minimum similarity for retrieved chunks.
    pub fn min_score(mut self, score: f32) -> Self {
        self.config.retrieval.min_score = score;
        self
    }

    /// Set the duplicate-detection distance in characters.
    pub fn dedup_char_distance(mut self, distance: usize) -> Self {
        self.config.retrieval.dedup_char_distance = distance;
        self
    }

    /// Set how many index candidates are fetched per requested result.
    pub fn candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.config.retrieval.candidate_multiplier = multiplier;
        self
    }

    /// Set the prompt token budget.
    pub fn context_budget_tokens(mut self, tokens: usize) -> Self {
        self.config.synthesis.context_budget_tokens = tokens;
        self
    }

    /// Replace the system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.synthesis.system_prompt = prompt.into();
        self
    }

    /// Set how many recent conversation turns are forwarded.
    pub fn max_history_turns(mut self, turns: usize) -> Self {
        self.config.synthesis.max_history_turns = turns;
        self
    }

    /// Set the behaviour when retrieval finds nothing.
    pub fn ungrounded_policy(mut self, policy: UngroundedPolicy) -> Self {
        self.config.synthesis.ungrounded_policy = policy;
        self
    }

    /// Set the per-call backend timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the retry schedule for backend calls.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.backend.retry = policy;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if:
    /// - `overlap_tokens >= max_tokens` or `max_tokens == 0`
    /// - `top_k == 0` or `min_score` is outside `[-1, 1]`
    /// - the budget, timeout or retry schedule is degenerate
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        RagConfig::default().validate().unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let err = RagConfig::builder().max_tokens(6).overlap_tokens(6).build().unwrap_err();
        assert!(matches!(err, RagError::Config { ref parameter, .. } if parameter == "overlap_tokens"));
    }

    #[test]
    fn rejects_zero_top_k() {
        let err = RagConfig::builder().top_k(0).build().unwrap_err();
        assert!(matches!(err, RagError::Config { ref parameter, .. } if parameter == "top_k"));
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let vars = HashMap::from([
            ("WOXION_RAG_MAX_TOKENS", "64"),
            ("WOXION_RAG_OVERLAP_TOKENS", "8"),
            ("WOXION_RAG_MIN_SCORE", "0.45"),
            ("WOXION_RAG_TIMEOUT_MS", "1500"),
        ]);
        let config =
            RagConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.chunking.max_tokens, 64);
        assert_eq!(config.chunking.overlap_tokens, 8);
        assert_eq!(config.retrieval.min_score, 0.45);
        assert_eq!(config.backend.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn unparsable_variable_names_the_key() {
        let err = RagConfig::from_lookup(|key| {
            (key == "WOXION_RAG_TOP_K").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(
            matches!(err, RagError::Config { ref parameter, .. } if parameter == "WOXION_RAG_TOP_K")
        );
    }

    #[test]
    fn round_trips_through_json() {
        let config = RagConfig::builder().top_k(7).build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: RagConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
