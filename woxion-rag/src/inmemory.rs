//! In-memory embedding index using cosine similarity.
//!
//! [`InMemoryEmbeddingIndex`] keeps embeddings in a slot vector protected by a
//! `tokio::sync::RwLock` and scans every live slot on search. Deletes leave
//! tombstones that are compacted once they exceed a fraction of the slots.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::document::{ChunkId, Embedding, rank_order};
use crate::error::{RagError, Result};
use crate::index::{EmbeddingIndex, IndexHit};

/// Fraction of tombstoned slots above which the index compacts itself.
pub const DEFAULT_COMPACTION_THRESHOLD: f32 = 0.25;

/// Tombstone counts below this never trigger compaction.
const MIN_TOMBSTONES_FOR_COMPACTION: usize = 64;

#[derive(Debug)]
struct Slot {
    embedding: Embedding,
    norm: f32,
}

#[derive(Debug, Default)]
struct IndexState {
    slots: Vec<Option<Slot>>,
    positions: HashMap<ChunkId, usize>,
    tombstones: usize,
    dimensions: Option<usize>,
    active_model: String,
}

impl IndexState {
    fn check_dimensions(&self, found: usize) -> Result<()> {
        match self.dimensions {
            Some(expected) if expected != found => {
                Err(RagError::DimensionMismatch { expected, found })
            }
            _ => Ok(()),
        }
    }

    fn remove_slot(&mut self, id: &ChunkId) -> bool {
        match self.positions.remove(id) {
            Some(position) => {
                self.slots[position] = None;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    fn compact(&mut self) -> usize {
        let reclaimed = self.tombstones;
        let live: Vec<Slot> = std::mem::take(&mut self.slots).into_iter().flatten().collect();
        self.positions.clear();
        for (position, slot) in live.iter().enumerate() {
            self.positions.insert(slot.embedding.chunk_id.clone(), position);
        }
        self.slots = live.into_iter().map(Some).collect();
        self.tombstones = 0;
        reclaimed
    }

    fn should_compact(&self, threshold: f32) -> bool {
        self.tombstones >= MIN_TOMBSTONES_FOR_COMPACTION
            && self.tombstones as f32 > self.slots.len() as f32 * threshold
    }
}

/// An in-memory embedding index using cosine similarity for search.
///
/// The vector dimensionality is fixed by the first upsert unless set up front
/// with [`with_dimensions`](InMemoryEmbeddingIndex::with_dimensions). Switching
/// the active model releases it, so the new model may use another size.
///
/// # Example
///
/// ```rust,ignore
/// use woxion_rag::{EmbeddingIndex, InMemoryEmbeddingIndex};
///
/// let index = InMemoryEmbeddingIndex::new("local-hash-v1").with_dimensions(4096);
/// ```
#[derive(Debug)]
pub struct InMemoryEmbeddingIndex {
    state: RwLock<IndexState>,
    compaction_threshold: f32,
}

impl InMemoryEmbeddingIndex {
    /// Create an empty index whose active model is `active_model`.
    pub fn new(active_model: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(IndexState {
                active_model: active_model.into(),
                ..IndexState::default()
            }),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// Fix the vector dimensionality before the first upsert.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.state.get_mut().dimensions = Some(dimensions);
        self
    }

    /// Fraction of tombstoned slots that triggers compaction.
    pub fn with_compaction_threshold(mut self, threshold: f32) -> Self {
        self.compaction_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// The fixed vector dimensionality, once known.
    pub async fn dimensions(&self) -> Option<usize> {
        self.state.read().await.dimensions
    }

    /// Number of tombstoned slots awaiting compaction.
    pub async fn tombstones(&self) -> usize {
        self.state.read().await.tombstones
    }

    /// Drop tombstoned slots now. Returns the number of slots reclaimed.
    pub async fn compact(&self) -> usize {
        let mut state = self.state.write().await;
        let reclaimed = state.compact();
        debug!(reclaimed, "compacted embedding index");
        reclaimed
    }

    fn after_delete(&self, state: &mut IndexState) {
        if state.should_compact(self.compaction_threshold) {
            let reclaimed = state.compact();
            debug!(reclaimed, "compacted embedding index after delete");
        }
    }
}

/// Compute the L2 norm of a vector.
fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Compute cosine similarity given precomputed norms.
///
/// Returns 0.0 if either vector has zero magnitude.
fn cosine_similarity(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[async_trait]
impl EmbeddingIndex for InMemoryEmbeddingIndex {
    async fn upsert_batch(&self, embeddings: Vec<Embedding>) -> Result<()> {
        if embeddings.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;

        let expected = state.dimensions.unwrap_or(embeddings[0].vector.len());
        for embedding in &embeddings {
            if embedding.vector.len() != expected {
                return Err(RagError::DimensionMismatch {
                    expected,
                    found: embedding.vector.len(),
                });
            }
        }
        state.dimensions = Some(expected);

        for embedding in embeddings {
            let slot = Slot { norm: norm(&embedding.vector), embedding };
            match state.positions.get(&slot.embedding.chunk_id).copied() {
                Some(position) => state.slots[position] = Some(slot),
                None => {
                    let position = state.slots.len();
                    state.positions.insert(slot.embedding.chunk_id.clone(), position);
                    state.slots.push(Some(slot));
                }
            }
        }
        Ok(())
    }

    async fn search_scoped(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        documents: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>> {
        let state = self.state.read().await;
        state.check_dimensions(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = norm(query);
        let mut hits: Vec<IndexHit> = state
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.embedding.model_tag == state.active_model)
            .filter(|slot| {
                documents.is_none_or(|ids| ids.contains(&slot.embedding.chunk_id.document_id))
            })
            .filter_map(|slot| {
                let score =
                    cosine_similarity(&slot.embedding.vector, slot.norm, query, query_norm);
                (score >= min_score)
                    .then(|| IndexHit { chunk_id: slot.embedding.chunk_id.clone(), score })
            })
            .collect();

        hits.sort_by(|a, b| rank_order(a.score, &a.chunk_id, b.score, &b.chunk_id));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let ids: Vec<ChunkId> =
            state.positions.keys().filter(|id| id.document_id == document_id).cloned().collect();
        for id in &ids {
            state.remove_slot(id);
        }
        self.after_delete(&mut state);
        Ok(ids.len())
    }

    async fn delete_chunks(&self, ids: &[ChunkId]) -> Result<usize> {
        let mut state = self.state.write().await;
        let removed = ids.iter().filter(|id| state.remove_slot(id)).count();
        self.after_delete(&mut state);
        Ok(removed)
    }

    async fn active_model(&self) -> String {
        self.state.read().await.active_model.clone()
    }

    async fn set_active_model(&self, model_tag: &str) {
        let mut state = self.state.write().await;
        if state.active_model != model_tag {
            debug!(from = %state.active_model, to = model_tag, "switching active embedding model");
            state.active_model = model_tag.to_string();
            state.dimensions = None;
        }
    }

    async fn stale_chunks(&self) -> Vec<ChunkId> {
        let state = self.state.read().await;
        let mut stale: Vec<ChunkId> = state
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.embedding.model_tag != state.active_model)
            .map(|slot| slot.embedding.chunk_id.clone())
            .collect();
        stale.sort();
        stale
    }

    async fn len(&self) -> usize {
        self.state.read().await.positions.len()
    }
}
