//! RAG pipeline orchestrator.
//!
//! The [`RagPipeline`] owns the [`ChunkStore`] and [`EmbeddingIndex`] and
//! coordinates document ingestion (chunk → embed → index → commit) and query
//! answering (retrieve → synthesize).
//!
//! # Example
//!
//! ```rust,ignore
//! use woxion_rag::{RagPipeline, RagConfig, HashingEmbeddingProvider, ExtractiveGenerator};
//!
//! let pipeline = RagPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(HashingEmbeddingProvider::default()))
//!     .generation_provider(Arc::new(ExtractiveGenerator::new()))
//!     .build()?;
//!
//! pipeline.ingest_document(document).await?;
//! let answer = pipeline.answer_query("How do refunds work?", None, &[]).await?;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::chunking::{Chunker, SemanticChunker};
use crate::config::RagConfig;
use crate::document::{
    Answer, ChunkId, ConversationTurn, Document, DocumentScope, Embedding, GenerationId,
};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::index::EmbeddingIndex;
use crate::inmemory::InMemoryEmbeddingIndex;
use crate::query::{QueryLifecycle, QueryState};
use crate::retriever::Retriever;
use crate::retry::call_with_retry;
use crate::store::{ChunkStore, CommitOutcome};
use crate::synthesizer::AnswerSynthesizer;

/// The RAG pipeline orchestrator.
///
/// Built once and shared by handle (`Arc<RagPipeline>`); every method takes
/// `&self` and is safe to call concurrently. Construct one via
/// [`RagPipeline::builder()`].
pub struct RagPipeline {
    config: RagConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    store: Arc<ChunkStore>,
    index: Arc<dyn EmbeddingIndex>,
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
}

impl RagPipeline {
    /// Create a new [`RagPipelineBuilder`].
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Return a reference to the chunk store.
    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Return a reference to the embedding index.
    pub fn index(&self) -> &Arc<dyn EmbeddingIndex> {
        &self.index
    }

    /// Return a reference to the retriever.
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Return a reference to the answer synthesizer.
    pub fn synthesizer(&self) -> &AnswerSynthesizer {
        &self.synthesizer
    }

    /// Ingest a document as a new generation and return its id.
    ///
    /// The new generation becomes visible to queries in a single step; until
    /// then queries keep seeing the previous generation, if any. Embeddings
    /// of the replaced generation are removed afterwards.
    ///
    /// If a newer generation of the same document was committed while this
    /// one was being embedded, this generation is discarded and its id is
    /// still returned; compare with [`ChunkStore::active_generation`].
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidDocument`] if the document has no text.
    /// - [`RagError::ModelMismatch`] if the embedder differs from the
    ///   index's active model.
    /// - [`RagError::UpstreamUnavailable`] if embedding keeps failing.
    pub async fn ingest_document(&self, document: Document) -> Result<GenerationId> {
        self.ingest_document_cancellable(document, &CancellationToken::new()).await
    }

    /// Like [`ingest_document`](RagPipeline::ingest_document), abandoned
    /// without any visible change as soon as `cancel` fires.
    pub async fn ingest_document_cancellable(
        &self,
        document: Document,
        cancel: &CancellationToken,
    ) -> Result<GenerationId> {
        self.ensure_model_matches().await?;

        let generation = self.store.next_generation();
        let chunks = self.chunker.chunk(&document, generation)?;
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();

        let embedder = &self.embedder;
        let vectors = call_with_retry(
            embedder.name(),
            "embed_batch",
            &self.config.backend.retry,
            self.config.backend.timeout(),
            cancel,
            || embedder.embed_batch(&texts),
        )
        .await
        .inspect_err(|e| {
            error!(document.id = %document.id, error = %e, "embedding failed during ingestion");
        })?;

        check_batch_len(embedder.as_ref(), vectors.len(), chunks.len())?;

        let model_tag = embedder.model_tag().to_string();
        let embeddings: Vec<Embedding> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id.clone(),
                vector,
                model_tag: model_tag.clone(),
            })
            .collect();
        let new_ids: Vec<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();

        self.index.upsert_batch(embeddings).await.inspect_err(|e| {
            error!(document.id = %document.id, error = %e, "index upsert failed during ingestion");
        })?;

        let document_id = document.id.clone();
        let chunk_count = chunks.len();
        match self.store.commit(document, generation, chunks).await {
            CommitOutcome::Created => {}
            CommitOutcome::Replaced { previous } => {
                let removed = self.index.delete_chunks(&previous).await?;
                debug!(document.id = %document_id, removed, "dropped previous generation");
            }
            CommitOutcome::Superseded { active } => {
                self.index.delete_chunks(&new_ids).await?;
                warn!(
                    document.id = %document_id,
                    %generation,
                    %active,
                    "generation superseded by a newer ingestion"
                );
                return Ok(generation);
            }
        }

        info!(document.id = %document_id, %generation, chunk_count, "ingested document");
        Ok(generation)
    }

    /// Remove a document, its chunks and their embeddings.
    ///
    /// Only the committed generation is removed. An ingestion of the same
    /// document still in flight is unaffected and commits as a new document.
    /// Returns the number of embeddings removed.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotFound`] if the document is not stored.
    pub async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let Some(chunk_ids) = self.store.remove(document_id).await else {
            return Err(RagError::NotFound(document_id.to_string()));
        };
        let removed = self.index.delete_chunks(&chunk_ids).await?;
        info!(document.id = %document_id, removed, "removed document");
        Ok(removed)
    }

    /// Regenerate embeddings that do not match the embedder's model.
    ///
    /// Switches the index to the embedder's model first, so re-embedded
    /// chunks are not retrievable until their new embedding is stored.
    /// Embeddings of chunks that no longer belong to an active generation
    /// are deleted. Returns the number of chunks re-embedded.
    pub async fn reembed_stale(&self) -> Result<usize> {
        let model_tag = self.embedder.model_tag().to_string();
        self.index.set_active_model(&model_tag).await;

        let stale = self.index.stale_chunks().await;
        if stale.is_empty() {
            return Ok(0);
        }

        let resolved = self.store.resolve(&stale).await;
        let mut orphaned = Vec::new();
        let mut chunks = Vec::new();
        for (id, chunk) in stale.into_iter().zip(resolved) {
            match chunk {
                Some(chunk) => chunks.push(chunk),
                None => orphaned.push(id),
            }
        }
        if !orphaned.is_empty() {
            self.index.delete_chunks(&orphaned).await?;
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embedder = &self.embedder;
        let cancel = CancellationToken::new();
        let vectors = call_with_retry(
            embedder.name(),
            "embed_batch",
            &self.config.backend.retry,
            self.config.backend.timeout(),
            &cancel,
            || embedder.embed_batch(&texts),
        )
        .await?;
        check_batch_len(embedder.as_ref(), vectors.len(), chunks.len())?;

        let embeddings: Vec<Embedding> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                chunk_id: chunk.id.clone(),
                vector,
                model_tag: model_tag.clone(),
            })
            .collect();
        let count = embeddings.len();
        self.index.upsert_batch(embeddings).await?;

        info!(
            model = %model_tag,
            reembedded = count,
            orphaned = orphaned.len(),
            "re-embedded stale chunks"
        );
        Ok(count)
    }

    /// Answer a query from the ingested documents.
    ///
    /// `scope` restricts retrieval to a subset of documents; `history` holds
    /// earlier turns of the conversation, oldest first.
    ///
    /// # Errors
    ///
    /// - [`RagError::ModelMismatch`] if the index must be re-embedded first.
    /// - [`RagError::BudgetExceeded`] if the query does not fit the budget.
    /// - [`RagError::UpstreamUnavailable`] if a backend keeps failing.
    pub async fn answer_query(
        &self,
        query: &str,
        scope: Option<&DocumentScope>,
        history: &[ConversationTurn],
    ) -> Result<Answer> {
        self.answer_query_cancellable(query, scope, history, CancellationToken::new()).await
    }

    /// Like [`answer_query`](RagPipeline::answer_query), failing with
    /// [`RagError::Cancelled`] as soon as `cancel` fires.
    pub async fn answer_query_cancellable(
        &self,
        query: &str,
        scope: Option<&DocumentScope>,
        history: &[ConversationTurn],
        cancel: CancellationToken,
    ) -> Result<Answer> {
        let query_id = Uuid::new_v4();
        let span = info_span!("answer_query", %query_id);
        async move {
            let mut lifecycle = QueryLifecycle::new(query_id);
            let result = self.run_query(&mut lifecycle, query, scope, history, &cancel).await;
            match &result {
                Ok(answer) => {
                    lifecycle.advance(QueryState::Completed);
                    info!(
                        citations = answer.citations.len(),
                        ungrounded = answer.ungrounded,
                        confidence = answer.confidence.score,
                        "query completed"
                    );
                }
                Err(e) => {
                    let stage = lifecycle.state();
                    lifecycle.advance(QueryState::Failed);
                    error!(%stage, error = %e, "query failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_query(
        &self,
        lifecycle: &mut QueryLifecycle,
        query: &str,
        scope: Option<&DocumentScope>,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        lifecycle.advance(QueryState::Retrieving);
        let retrieval_config = self.retriever.config();
        let retrieval = self
            .retriever
            .retrieve_scoped(
                query,
                retrieval_config.top_k,
                retrieval_config.min_score,
                scope,
                cancel,
            )
            .await?;
        debug!(
            retrieved = retrieval.len(),
            top_score = ?retrieval.top_score(),
            "retrieved context"
        );

        lifecycle.advance(QueryState::Synthesizing);
        self.synthesizer
            .synthesize_cancellable(lifecycle.id(), query, &retrieval, history, cancel)
            .await
    }

    async fn ensure_model_matches(&self) -> Result<()> {
        let active = self.index.active_model().await;
        if active != self.embedder.model_tag() {
            return Err(RagError::ModelMismatch {
                expected: active,
                found: self.embedder.model_tag().to_string(),
            });
        }
        Ok(())
    }
}

fn check_batch_len(
    embedder: &dyn EmbeddingProvider,
    vectors: usize,
    chunks: usize,
) -> Result<()> {
    if vectors != chunks {
        return Err(RagError::Backend {
            backend: embedder.name().to_string(),
            message: format!("returned {vectors} embeddings for {chunks} chunks"),
        });
    }
    Ok(())
}

/// Builder for constructing a [`RagPipeline`].
///
/// The embedding and generation providers are required. The index defaults
/// to an [`InMemoryEmbeddingIndex`] for the embedder's model, the chunker to
/// a [`SemanticChunker`] from the chunking configuration, and the config to
/// [`RagConfig::default()`].
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RagPipeline::builder()
///     .config(RagConfig::from_env()?)
///     .embedding_provider(Arc::new(embedder))
///     .generation_provider(Arc::new(generator))
///     .index(Arc::new(index))  // optional
///     .build()?;
/// ```
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    generation_provider: Option<Arc<dyn GenerationProvider>>,
    index: Option<Arc<dyn EmbeddingIndex>>,
    chunker: Option<Arc<dyn Chunker>>,
    chunk_store: Option<Arc<ChunkStore>>,
}

impl RagPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the generation provider.
    pub fn generation_provider(mut self, provider: Arc<dyn GenerationProvider>) -> Self {
        self.generation_provider = Some(provider);
        self
    }

    /// Set the embedding index backend.
    pub fn index(mut self, index: Arc<dyn EmbeddingIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the document chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Share an existing chunk store.
    pub fn chunk_store(mut self, store: Arc<ChunkStore>) -> Self {
        self.chunk_store = Some(store);
        self
    }

    /// Build the [`RagPipeline`], validating the configuration and that all
    /// required fields are set.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if a provider is missing or the
    /// configuration is invalid.
    pub fn build(self) -> Result<RagPipeline> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let embedder = self
            .embedding_provider
            .ok_or_else(|| RagError::config("embedding_provider", "is required"))?;
        let generator = self
            .generation_provider
            .ok_or_else(|| RagError::config("generation_provider", "is required"))?;
        let chunker: Arc<dyn Chunker> = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(SemanticChunker::from_config(&config.chunking)?),
        };
        let index: Arc<dyn EmbeddingIndex> = self.index.unwrap_or_else(|| {
            Arc::new(
                InMemoryEmbeddingIndex::new(embedder.model_tag())
                    .with_dimensions(embedder.dimensions()),
            )
        });
        let store = self.chunk_store.unwrap_or_default();

        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            config.retrieval.clone(),
            config.backend.clone(),
        );
        let synthesizer =
            AnswerSynthesizer::new(generator, config.synthesis.clone(), config.backend.clone());

        Ok(RagPipeline { config, embedder, chunker, store, index, retriever, synthesizer })
    }
}
