//! Backend selection.
//!
//! [`ProviderConfig`] names which embedding and generation backends a
//! deployment uses and carries their credentials. It is resolved once at
//! startup into trait objects handed to [`RagPipeline::builder`](crate::RagPipeline::builder).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CachedEmbeddingProvider;
use crate::config::read_var;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::local::{DEFAULT_HASH_DIMENSIONS, ExtractiveGenerator, HashingEmbeddingProvider};

/// A backend family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Offline hashing embedder and extractive generator.
    #[default]
    Local,
    /// OpenAI or an OpenAI-compatible server.
    #[serde(rename = "openai")]
    OpenAi,
    /// Google Gemini.
    Gemini,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider '{other}', expected local, openai or gemini")),
        }
    }
}

/// Which backends to use and how to reach them.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Embedding backend.
    pub embedding: ProviderKind,
    /// Generation backend.
    pub generation: ProviderKind,
    /// Embedding model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Generation model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
    /// Embedding dimensionality override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
    /// Embeddings kept in the LRU cache; zero disables caching.
    pub cache_capacity: usize,
    /// OpenAI API key.
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    /// Base URL of an OpenAI-compatible server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_base_url: Option<String>,
    /// Google API key for Gemini.
    #[serde(skip_serializing)]
    pub google_api_key: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("embedding", &self.embedding)
            .field("generation", &self.generation)
            .field("embedding_model", &self.embedding_model)
            .field("generation_model", &self.generation_model)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("cache_capacity", &self.cache_capacity)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field("openai_base_url", &self.openai_base_url)
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProviderConfig {
    /// Local backends for both embedding and generation.
    pub fn local() -> Self {
        Self::default()
    }

    /// Read the configuration from the environment.
    ///
    /// Recognised variables: `WOXION_RAG_EMBEDDING_PROVIDER`,
    /// `WOXION_RAG_GENERATION_PROVIDER`, `WOXION_RAG_EMBEDDING_MODEL`,
    /// `WOXION_RAG_GENERATION_MODEL`, `WOXION_RAG_EMBEDDING_DIMENSIONS`,
    /// `WOXION_RAG_EMBEDDING_CACHE`, `OPENAI_API_KEY`, `OPENAI_BASE_URL`,
    /// `GOOGLE_API_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](ProviderConfig::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        read_var(&lookup, "WOXION_RAG_EMBEDDING_PROVIDER", &mut config.embedding)?;
        read_var(&lookup, "WOXION_RAG_GENERATION_PROVIDER", &mut config.generation)?;
        read_var(&lookup, "WOXION_RAG_EMBEDDING_CACHE", &mut config.cache_capacity)?;
        if lookup("WOXION_RAG_EMBEDDING_DIMENSIONS").is_some() {
            let mut dimensions = 0usize;
            read_var(&lookup, "WOXION_RAG_EMBEDDING_DIMENSIONS", &mut dimensions)?;
            config.embedding_dimensions = Some(dimensions);
        }
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        config.embedding_model = non_empty("WOXION_RAG_EMBEDDING_MODEL");
        config.generation_model = non_empty("WOXION_RAG_GENERATION_MODEL");
        config.openai_api_key = non_empty("OPENAI_API_KEY");
        config.openai_base_url = non_empty("OPENAI_BASE_URL");
        config.google_api_key = non_empty("GOOGLE_API_KEY");
        Ok(config)
    }

    /// Build the configured embedding backend, wrapped in an LRU cache when
    /// `cache_capacity` is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if a credential is missing or the backend
    /// was not compiled in.
    pub fn embedding_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match self.embedding {
            ProviderKind::Local => Arc::new(HashingEmbeddingProvider::new(
                self.embedding_dimensions.unwrap_or(DEFAULT_HASH_DIMENSIONS),
            )),
            ProviderKind::OpenAi => self.openai_embedding()?,
            ProviderKind::Gemini => self.gemini_embedding()?,
        };
        info!(
            provider = %self.embedding,
            model = provider.model_tag(),
            cache_capacity = self.cache_capacity,
            "embedding backend ready"
        );
        if self.cache_capacity == 0 {
            return Ok(provider);
        }
        Ok(Arc::new(CachedEmbeddingProvider::new(provider, self.cache_capacity)?))
    }

    /// Build the configured generation backend.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if a credential is missing or the backend
    /// was not compiled in.
    pub fn generation_provider(&self) -> Result<Arc<dyn GenerationProvider>> {
        let provider: Arc<dyn GenerationProvider> = match self.generation {
            ProviderKind::Local => Arc::new(ExtractiveGenerator::new()),
            ProviderKind::OpenAi => self.openai_generation()?,
            ProviderKind::Gemini => self.gemini_generation()?,
        };
        info!(provider = %self.generation, "generation backend ready");
        Ok(provider)
    }

    #[cfg(feature = "openai")]
    fn openai_embedding(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        use crate::openai::OpenAIEmbeddingProvider;

        let mut provider = match &self.openai_base_url {
            Some(url) => OpenAIEmbeddingProvider::compatible(
                url.clone(),
                self.openai_api_key.clone().unwrap_or_default(),
            )?,
            None => OpenAIEmbeddingProvider::new(self.openai_key()?)?,
        };
        if let Some(model) = &self.embedding_model {
            provider = provider.with_model(model.clone());
        }
        if let Some(dimensions) = self.embedding_dimensions {
            provider = provider.with_dimensions(dimensions);
        }
        Ok(Arc::new(provider))
    }

    #[cfg(feature = "openai")]
    fn openai_generation(&self) -> Result<Arc<dyn GenerationProvider>> {
        use crate::openai::OpenAIChatProvider;

        let mut provider = match &self.openai_base_url {
            Some(url) => OpenAIChatProvider::compatible(
                url.clone(),
                self.openai_api_key.clone().unwrap_or_default(),
            )?,
            None => OpenAIChatProvider::new(self.openai_key()?)?,
        };
        if let Some(model) = &self.generation_model {
            provider = provider.with_model(model.clone());
        }
        Ok(Arc::new(provider))
    }

    #[cfg(feature = "openai")]
    fn openai_key(&self) -> Result<String> {
        self.openai_api_key
            .clone()
            .ok_or_else(|| RagError::config("OPENAI_API_KEY", "required for the openai provider"))
    }

    #[cfg(not(feature = "openai"))]
    fn openai_embedding(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        Err(not_compiled(ProviderKind::OpenAi))
    }

    #[cfg(not(feature = "openai"))]
    fn openai_generation(&self) -> Result<Arc<dyn GenerationProvider>> {
        Err(not_compiled(ProviderKind::OpenAi))
    }

    #[cfg(feature = "gemini")]
    fn gemini_key(&self) -> Result<String> {
        self.google_api_key
            .clone()
            .ok_or_else(|| RagError::config("GOOGLE_API_KEY", "required for the gemini provider"))
    }

    #[cfg(feature = "gemini")]
    fn gemini_embedding(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        use crate::gemini::GeminiEmbeddingProvider;

        let mut provider = GeminiEmbeddingProvider::new(self.gemini_key()?)?;
        if let Some(model) = &self.embedding_model {
            provider = provider.with_model(model.clone());
        }
        if let Some(dimensions) = self.embedding_dimensions {
            provider = provider.with_output_dimensionality(dimensions);
        }
        Ok(Arc::new(provider))
    }

    #[cfg(feature = "gemini")]
    fn gemini_generation(&self) -> Result<Arc<dyn GenerationProvider>> {
        use crate::gemini::GeminiGenerationProvider;

        let mut provider = GeminiGenerationProvider::new(self.gemini_key()?)?;
        if let Some(model) = &self.generation_model {
            provider = provider.with_model(model.clone());
        }
        Ok(Arc::new(provider))
    }

    #[cfg(not(feature = "gemini"))]
    fn gemini_embedding(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        Err(not_compiled(ProviderKind::Gemini))
    }

    #[cfg(not(feature = "gemini"))]
    fn gemini_generation(&self) -> Result<Arc<dyn GenerationProvider>> {
        Err(not_compiled(ProviderKind::Gemini))
    }
}

#[cfg(any(not(feature = "openai"), not(feature = "gemini")))]
fn not_compiled(kind: ProviderKind) -> RagError {
    RagError::config("provider", format!("the '{kind}' feature is not enabled"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_local() {
        let config = ProviderConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.embedding, ProviderKind::Local);
        assert_eq!(config.generation, ProviderKind::Local);
        let embedder = config.embedding_provider().unwrap();
        assert_eq!(embedder.dimensions(), DEFAULT_HASH_DIMENSIONS);
    }

    #[test]
    fn reads_kinds_and_overrides() {
        let config = ProviderConfig::from_lookup(lookup(&[
            ("WOXION_RAG_EMBEDDING_PROVIDER", "OpenAI"),
            ("WOXION_RAG_GENERATION_PROVIDER", "gemini"),
            ("WOXION_RAG_EMBEDDING_DIMENSIONS", "256"),
            ("WOXION_RAG_EMBEDDING_CACHE", "50"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.embedding, ProviderKind::OpenAi);
        assert_eq!(config.generation, ProviderKind::Gemini);
        assert_eq!(config.embedding_dimensions, Some(256));
        assert_eq!(config.cache_capacity, 50);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let vars = [("WOXION_RAG_EMBEDDING_PROVIDER", "bert")];
        let err = ProviderConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, RagError::Config { .. }));
    }

    #[test]
    fn debug_redacts_keys() {
        let config =
            ProviderConfig { openai_api_key: Some("sk-secret".into()), ..ProviderConfig::local() };
        assert!(!format!("{config:?}").contains("sk-secret"));
    }

    #[test]
    fn cache_wraps_local_embedder() {
        let config = ProviderConfig { cache_capacity: 10, ..ProviderConfig::local() };
        let embedder = config.embedding_provider().unwrap();
        assert_eq!(embedder.model_tag(), HashingEmbeddingProvider::default().model_tag());
    }
}
