//! Storage of documents and their active chunk generation.
//!
//! The [`ChunkStore`] is the visibility gate for ingestion: a chunk is only
//! resolvable once its whole generation has been committed, and committing
//! swaps a document's generation in a single write. Embeddings for a
//! generation may therefore be written to the index before the commit
//! without queries ever seeing a half-ingested document.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::document::{Chunk, ChunkId, Document, DocumentScope, GenerationId};

/// Result of [`ChunkStore::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The document was not stored before.
    Created,
    /// An older generation was replaced; its chunk ids are now invalid.
    Replaced {
        /// Chunk ids of the replaced generation.
        previous: Vec<ChunkId>,
    },
    /// A newer generation was committed concurrently; this one was discarded.
    Superseded {
        /// The generation that stays active.
        active: GenerationId,
    },
}

#[derive(Debug)]
struct StoredDocument {
    document: Arc<Document>,
    generation: GenerationId,
    chunks: Vec<Arc<Chunk>>,
}

impl StoredDocument {
    fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.iter().map(|c| c.id.clone()).collect()
    }
}

/// Holds documents and the chunks of their active generation.
///
/// All operations are async-safe via `tokio::sync::RwLock`.
#[derive(Debug)]
pub struct ChunkStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    next_generation: AtomicU64,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self { documents: RwLock::new(HashMap::new()), next_generation: AtomicU64::new(1) }
    }
}

impl ChunkStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh generation id. Ids are strictly increasing.
    pub fn next_generation(&self) -> GenerationId {
        GenerationId(self.next_generation.fetch_add(1, Ordering::Relaxed))
    }

    /// Make `chunks` the visible generation of `document`.
    ///
    /// A generation older than the one already active is discarded and
    /// reported as [`CommitOutcome::Superseded`].
    pub async fn commit(
        &self,
        document: Document,
        generation: GenerationId,
        chunks: Vec<Chunk>,
    ) -> CommitOutcome {
        let mut documents = self.documents.write().await;
        let previous = match documents.get(&document.id) {
            Some(existing) if existing.generation > generation => {
                return CommitOutcome::Superseded { active: existing.generation };
            }
            Some(existing) => Some(existing.chunk_ids()),
            None => None,
        };

        let id = document.id.clone();
        documents.insert(
            id,
            StoredDocument {
                document: Arc::new(document),
                generation,
                chunks: chunks.into_iter().map(Arc::new).collect(),
            },
        );

        match previous {
            Some(previous) => CommitOutcome::Replaced { previous },
            None => CommitOutcome::Created,
        }
    }

    /// Remove a document, returning the chunk ids it had.
    pub async fn remove(&self, document_id: &str) -> Option<Vec<ChunkId>> {
        let mut documents = self.documents.write().await;
        documents.remove(document_id).map(|stored| stored.chunk_ids())
    }

    /// The stored document.
    pub async fn document(&self, document_id: &str) -> Option<Arc<Document>> {
        let documents = self.documents.read().await;
        documents.get(document_id).map(|stored| stored.document.clone())
    }

    /// The active generation of a document.
    pub async fn active_generation(&self, document_id: &str) -> Option<GenerationId> {
        let documents = self.documents.read().await;
        documents.get(document_id).map(|stored| stored.generation)
    }

    /// Chunks of the document's active generation, in sequence order.
    pub async fn chunks(&self, document_id: &str) -> Option<Vec<Chunk>> {
        let documents = self.documents.read().await;
        documents
            .get(document_id)
            .map(|stored| stored.chunks.iter().map(|c| Chunk::clone(c)).collect())
    }

    /// Resolve a chunk id to its chunk if it belongs to an active generation.
    pub async fn get(&self, id: &ChunkId) -> Option<Chunk> {
        let documents = self.documents.read().await;
        lookup(&documents, id).cloned()
    }

    /// Resolve many chunk ids under one read lock. Ids of inactive
    /// generations or removed documents resolve to `None`.
    pub async fn resolve(&self, ids: &[ChunkId]) -> Vec<Option<Chunk>> {
        let documents = self.documents.read().await;
        ids.iter().map(|id| lookup(&documents, id).cloned()).collect()
    }

    /// Identifiers of stored documents admitted by `scope`.
    pub async fn documents_in_scope(&self, scope: &DocumentScope) -> HashSet<String> {
        let documents = self.documents.read().await;
        documents
            .values()
            .filter(|stored| {
                scope.admits(&stored.document.id, stored.document.metadata.owner.as_deref())
            })
            .map(|stored| stored.document.id.clone())
            .collect()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether no documents are stored.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

fn lookup<'a>(documents: &'a HashMap<String, StoredDocument>, id: &ChunkId) -> Option<&'a Chunk> {
    let stored = documents.get(&id.document_id)?;
    if stored.generation != id.generation {
        return None;
    }
    stored.chunks.get(id.index as usize).map(|c| c.as_ref()).filter(|c| &c.id == id)
}
