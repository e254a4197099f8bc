//! Embedding index trait for storing and searching chunk embeddings.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{ChunkId, Embedding};
use crate::error::Result;

/// A chunk id paired with its cosine similarity to a query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    /// The matching chunk.
    pub chunk_id: ChunkId,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// A storage backend for chunk embeddings with similarity search.
///
/// The index has one *active model*. Only embeddings tagged with that model
/// are visible to search; embeddings from any other model stay stored but
/// are reported by [`stale_chunks`](EmbeddingIndex::stale_chunks) until they
/// are regenerated.
///
/// Writers are serialized and readers never observe a partially written
/// vector: a search sees each chunk's embedding either fully before or fully
/// after a concurrent write.
///
/// # Example
///
/// ```rust,ignore
/// use woxion_rag::{EmbeddingIndex, InMemoryEmbeddingIndex};
///
/// let index = InMemoryEmbeddingIndex::new("local-hash-v1");
/// index.upsert(chunk_id, vector, "local-hash-v1").await?;
/// let hits = index.search(&query_vector, 5, 0.3).await?;
/// ```
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Insert or replace the embedding of one chunk.
    async fn upsert(&self, chunk_id: ChunkId, vector: Vec<f32>, model_tag: &str) -> Result<()> {
        self.upsert_batch(vec![Embedding { chunk_id, vector, model_tag: model_tag.to_string() }])
            .await
    }

    /// Insert or replace several embeddings in one write. Either all of them
    /// are stored or, on error, none.
    async fn upsert_batch(&self, embeddings: Vec<Embedding>) -> Result<()>;

    /// Return at most `k` hits scoring at least `min_score`, ordered by
    /// descending score with ties broken by ascending chunk id.
    async fn search(&self, query: &[f32], k: usize, min_score: f32) -> Result<Vec<IndexHit>> {
        self.search_scoped(query, k, min_score, None).await
    }

    /// Like [`search`](EmbeddingIndex::search), restricted to chunks of the
    /// listed documents when `documents` is set.
    async fn search_scoped(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        documents: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>>;

    /// Remove every embedding belonging to the document. Returns how many
    /// embeddings were removed.
    async fn delete(&self, document_id: &str) -> Result<usize>;

    /// Remove the embeddings of specific chunks. Returns how many were removed.
    async fn delete_chunks(&self, ids: &[ChunkId]) -> Result<usize>;

    /// The model tag that search currently scans.
    async fn active_model(&self) -> String;

    /// Switch the active model. Embeddings from other models become stale.
    async fn set_active_model(&self, model_tag: &str);

    /// Chunks whose stored embedding does not match the active model.
    async fn stale_chunks(&self) -> Vec<ChunkId>;

    /// Number of stored embeddings, stale ones included.
    async fn len(&self) -> usize;
}
