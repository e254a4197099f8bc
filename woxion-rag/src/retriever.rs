//! Query-time retrieval: embed, search, resolve, deduplicate.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{BackendConfig, RetrievalConfig};
use crate::document::{DocumentScope, RetrievalResult, ScoredChunk};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::EmbeddingIndex;
use crate::retry::call_with_retry;
use crate::store::ChunkStore;

/// Produces ranked, deduplicated [`RetrievalResult`]s for query text.
///
/// Index hits are resolved through the [`ChunkStore`], so chunks from a
/// generation that is not (or no longer) active never reach the caller.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn EmbeddingIndex>,
    store: Arc<ChunkStore>,
    config: RetrievalConfig,
    backend: BackendConfig,
}

impl Retriever {
    /// Create a retriever over the given index and store.
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn EmbeddingIndex>,
        store: Arc<ChunkStore>,
        config: RetrievalConfig,
        backend: BackendConfig,
    ) -> Self {
        Self { embedder, index, store, config, backend }
    }

    /// The retrieval configuration.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve at most `top_k` chunks scoring at least `min_score`.
    ///
    /// An empty result means nothing relevant was found; it is not an error.
    ///
    /// # Errors
    ///
    /// - [`RagError::ModelMismatch`] if the embedder's model differs from the
    ///   index's active model.
    /// - [`RagError::UpstreamUnavailable`] if embedding the query keeps failing.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<RetrievalResult> {
        self.retrieve_scoped(query, top_k, min_score, None, &CancellationToken::new()).await
    }

    /// Like [`retrieve`](Retriever::retrieve), restricted to `scope` and
    /// abandoned as soon as `cancel` fires.
    pub async fn retrieve_scoped(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
        scope: Option<&DocumentScope>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult> {
        let active = self.index.active_model().await;
        if active != self.embedder.model_tag() {
            return Err(RagError::ModelMismatch {
                expected: active,
                found: self.embedder.model_tag().to_string(),
            });
        }
        if top_k == 0 {
            return Ok(RetrievalResult::empty());
        }

        let allowed: Option<HashSet<String>> = match scope {
            Some(scope) => {
                let ids = self.store.documents_in_scope(scope).await;
                if ids.is_empty() {
                    debug!("no documents in scope");
                    return Ok(RetrievalResult::empty());
                }
                Some(ids)
            }
            None => None,
        };

        let embedder = &self.embedder;
        let vector = call_with_retry(
            embedder.name(),
            "embed_query",
            &self.backend.retry,
            self.backend.timeout(),
            cancel,
            || embedder.embed(query),
        )
        .await?;

        let fetch = top_k.saturating_mul(self.config.candidate_multiplier.max(1));
        let hits = self.index.search_scoped(&vector, fetch, min_score, allowed.as_ref()).await?;
        let candidate_count = hits.len();

        let ids: Vec<_> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let resolved = self.store.resolve(&ids).await;
        let candidates: Vec<ScoredChunk> = hits
            .into_iter()
            .zip(resolved)
            .filter_map(|(hit, chunk)| chunk.map(|chunk| ScoredChunk { chunk, score: hit.score }))
            .collect();

        let mut kept = deduplicate(candidates, self.config.dedup_char_distance);
        kept.truncate(top_k);
        debug!(candidates = candidate_count, returned = kept.len(), "retrieval finished");
        Ok(RetrievalResult::from_unsorted(kept))
    }
}

/// Drop candidates lying within `max_distance` characters of a better-ranked
/// candidate from the same document. Input must be in rank order.
fn deduplicate(candidates: Vec<ScoredChunk>, max_distance: usize) -> Vec<ScoredChunk> {
    let mut kept: Vec<ScoredChunk> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept.iter().any(|existing| {
            existing.chunk.document_id() == candidate.chunk.document_id()
                && existing.chunk.distance_to(&candidate.chunk) <= max_distance
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Chunk, ChunkId, GenerationId};

    fn scored(doc: &str, index: u32, start: usize, end: usize, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: ChunkId::new(doc, GenerationId(1), index),
                text: "x".repeat(end - start),
                start,
                end,
                token_count: 1,
            },
            score,
        }
    }

    #[test]
    fn overlapping_chunks_keep_the_best() {
        let kept = deduplicate(
            vec![scored("a", 1, 10, 30, 0.9), scored("a", 0, 0, 15, 0.8), scored("b", 0, 0, 15, 0.7)],
            0,
        );
        let ids: Vec<u32> = kept.iter().map(|c| c.chunk.id.index).collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(ids, vec![1, 0]);
        assert_eq!(kept[1].chunk.document_id(), "b");
    }

    #[test]
    fn distance_threshold_widens_dedup() {
        let candidates = vec![scored("a", 0, 0, 10, 0.9), scored("a", 1, 15, 25, 0.8)];
        assert_eq!(deduplicate(candidates.clone(), 0).len(), 2);
        assert_eq!(deduplicate(candidates, 5).len(), 1);
    }
}
