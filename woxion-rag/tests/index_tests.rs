//! Property tests for in-memory embedding index search and deletion.

use std::collections::HashSet;

use proptest::prelude::*;
use woxion_rag::{ChunkId, Embedding, EmbeddingIndex, GenerationId, InMemoryEmbeddingIndex};

const MODEL: &str = "test-model";

/// Generate a non-zero L2-normalized embedding of the given dimension.
fn arb_normalized_embedding(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim).prop_filter_map(
        "non-zero embedding",
        |mut v| {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm < 1e-8 {
                return None;
            }
            for val in &mut v {
                *val /= norm;
            }
            Some(v)
        },
    )
}

/// Generate an embedding for a chunk of one of a few documents.
fn arb_embedding(dim: usize) -> impl Strategy<Value = Embedding> {
    ("doc_[a-c]", 0u32..8, arb_normalized_embedding(dim)).prop_map(|(doc, index, vector)| {
        Embedding {
            chunk_id: ChunkId::new(doc, GenerationId(1), index),
            vector,
            model_tag: MODEL.to_string(),
        }
    })
}

fn unique_by_id(embeddings: Vec<Embedding>) -> Vec<Embedding> {
    let mut seen = HashSet::new();
    embeddings.into_iter().filter(|e| seen.insert(e.chunk_id.clone())).collect()
}

/// *For any* set of stored embeddings, search returns at most `k` hits, every
/// hit scores at least `min_score`, and hits are ordered by descending score
/// with ties broken by ascending chunk id.
mod prop_search_bounds_and_order {
    use super::*;

    const DIM: usize = 16;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn results_bounded_thresholded_and_ordered(
            embeddings in proptest::collection::vec(arb_embedding(DIM), 1..20),
            query in arb_normalized_embedding(DIM),
            k in 0usize..25,
            min_score in -1.0f32..1.0f32,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let unique = unique_by_id(embeddings);
            let stored = unique.len();
            let hits = rt.block_on(async {
                let index = InMemoryEmbeddingIndex::new(MODEL);
                index.upsert_batch(unique).await.unwrap();
                index.search(&query, k, min_score).await.unwrap()
            });

            prop_assert!(hits.len() <= k);
            prop_assert!(hits.len() <= stored);
            for hit in &hits {
                prop_assert!(hit.score >= min_score);
            }
            for window in hits.windows(2) {
                prop_assert!(
                    window[0].score > window[1].score
                        || (window[0].score == window[1].score
                            && window[0].chunk_id < window[1].chunk_id),
                    "hits out of order: {:?} then {:?}",
                    window[0],
                    window[1],
                );
            }
        }

        #[test]
        fn delete_removes_every_embedding_of_the_document(
            embeddings in proptest::collection::vec(arb_embedding(DIM), 1..30),
            query in arb_normalized_embedding(DIM),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let unique = unique_by_id(embeddings);
            let doc_a = unique.iter().filter(|e| e.chunk_id.document_id == "doc_a").count();
            let (removed, hits, remaining) = rt.block_on(async {
                let index = InMemoryEmbeddingIndex::new(MODEL);
                let total = unique.len();
                index.upsert_batch(unique).await.unwrap();
                let removed = index.delete("doc_a").await.unwrap();
                let hits = index.search(&query, 100, -1.0).await.unwrap();
                (removed, hits, (total, index.len().await))
            });

            prop_assert_eq!(removed, doc_a);
            prop_assert_eq!(remaining.1, remaining.0 - doc_a);
            prop_assert!(hits.iter().all(|h| h.chunk_id.document_id != "doc_a"));
            prop_assert_eq!(hits.len(), remaining.1);
        }
    }
}

#[tokio::test]
async fn concurrent_readers_see_whole_vectors() {
    use std::sync::Arc;

    let index = Arc::new(InMemoryEmbeddingIndex::new(MODEL));
    let id = ChunkId::new("doc", GenerationId(1), 0);
    index.upsert(id.clone(), vec![1.0, 0.0], MODEL).await.unwrap();

    let writer = {
        let index = index.clone();
        let id = id.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let vector = if i % 2 == 0 { vec![0.0, 1.0] } else { vec![1.0, 0.0] };
                index.upsert(id.clone(), vector, MODEL).await.unwrap();
            }
        })
    };

    for _ in 0..200 {
        let hits = index.search(&[1.0, 0.0], 1, -1.0).await.unwrap();
        let score = hits[0].score;
        // a torn write would produce a mix of both vectors
        assert!(score.abs() < 1e-6 || (score - 1.0).abs() < 1e-6, "score {score}");
    }
    writer.await.unwrap();
}
