//! # woxion-rag
//!
//! Retrieval-augmented generation core for the WoxionChat support assistant.
//!
//! ## Overview
//!
//! Documents are split by a [`SemanticChunker`] into overlapping,
//! sentence-aligned chunks, stored in a [`ChunkStore`], and embedded into an
//! [`EmbeddingIndex`]. A query is embedded with the same model, matched
//! against the index by the [`Retriever`], and answered by the
//! [`AnswerSynthesizer`], which builds a budgeted prompt with numbered
//! passages and maps the `[n]` markers in the reply back to chunk ids.
//!
//! [`RagPipeline`] wires these together:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use woxion_rag::{Document, ProviderConfig, RagConfig, RagPipeline};
//!
//! let providers = ProviderConfig::from_env()?;
//! let pipeline = RagPipeline::builder()
//!     .config(RagConfig::from_env()?)
//!     .embedding_provider(providers.embedding_provider()?)
//!     .generation_provider(providers.generation_provider()?)
//!     .build()?;
//!
//! pipeline.ingest_document(Document::new("refunds", "Refunds take five days.")).await?;
//! let answer = pipeline.answer_query("How long do refunds take?", None, &[]).await?;
//! println!("{} {:?}", answer.text, answer.citations);
//! ```
//!
//! ## Backends
//!
//! - `local` (always available): [`HashingEmbeddingProvider`] and
//!   [`ExtractiveGenerator`], fully offline.
//! - `openai` feature: OpenAI and OpenAI-compatible servers.
//! - `gemini` feature: Google Gemini.
//!
//! Every backend call runs under a per-call timeout with bounded,
//! jittered exponential backoff and can be cancelled with a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod cache;
pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod generation;
#[cfg(any(feature = "openai", feature = "gemini"))]
mod http;
pub mod index;
pub mod inmemory;
pub mod local;
pub mod normalize;
#[cfg(feature = "openai")]
pub mod openai;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod retriever;
pub mod retry;
pub mod store;
pub mod synthesizer;

pub use cache::CachedEmbeddingProvider;
pub use chunking::{ChunkSpan, Chunker, SemanticChunker, estimate_tokens};
pub use config::{
    BackendConfig, ChunkingConfig, RagConfig, RagConfigBuilder, RetrievalConfig, SynthesisConfig,
    UngroundedPolicy,
};
pub use document::{
    Answer, Chunk, ChunkId, Confidence, ConfidenceLevel, ConversationTurn, Document,
    DocumentMetadata, DocumentScope, Embedding, GenerationId, RetrievalResult, Role, ScoredChunk,
};
pub use embedding::EmbeddingProvider;
pub use error::{RagError, Result};
#[cfg(feature = "gemini")]
pub use gemini::{GeminiEmbeddingProvider, GeminiGenerationProvider};
pub use generation::{Generated, GenerationProvider};
pub use index::{EmbeddingIndex, IndexHit};
pub use inmemory::InMemoryEmbeddingIndex;
pub use local::{ExtractiveGenerator, HashingEmbeddingProvider};
#[cfg(feature = "openai")]
pub use openai::{OpenAIChatProvider, OpenAIEmbeddingProvider};
pub use pipeline::{RagPipeline, RagPipelineBuilder};
pub use provider::{ProviderConfig, ProviderKind};
pub use query::{QueryLifecycle, QueryState};
pub use retriever::Retriever;
pub use retry::{RetryPolicy, call_with_retry};
pub use store::{ChunkStore, CommitOutcome};
pub use synthesizer::{AnswerSynthesizer, Prompt};
pub use tokio_util::sync::CancellationToken;
