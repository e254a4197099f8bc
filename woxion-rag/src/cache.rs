//! LRU cache in front of an embedding backend.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

/// Default number of cached embeddings.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Wraps an [`EmbeddingProvider`] and remembers the vectors of recently
/// embedded texts. Repeated questions skip the backend entirely.
///
/// The cache is keyed by text only; it reports the wrapped provider's model
/// tag and dimensions unchanged.
pub struct CachedEmbeddingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbeddingProvider {
    /// Cache up to `capacity` embeddings from `inner`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if `capacity` is zero.
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| RagError::config("cache_capacity", "must be greater than zero"))?;
        Ok(Self { inner, cache: Mutex::new(LruCache::new(capacity)) })
    }

    /// Cache up to [`DEFAULT_CACHE_CAPACITY`] embeddings.
    pub fn with_default_capacity(inner: Arc<dyn EmbeddingProvider>) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// Number of cached embeddings.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.lock().await.get(text) {
            debug!(provider = self.inner.name(), "embedding cache hit");
            return Ok(hit.clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache.lock().await.put(text.to_string(), vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = {
            let mut cache = self.cache.lock().await;
            texts.iter().map(|text| cache.get(*text).cloned()).collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let vectors = self.inner.embed_batch(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::Backend {
                    backend: self.inner.name().to_string(),
                    message: format!(
                        "returned {} embeddings for {} texts",
                        vectors.len(),
                        batch.len()
                    ),
                });
            }
            let mut cache = self.cache.lock().await;
            for (&i, vector) in missing.iter().zip(vectors) {
                cache.put(texts[i].to_string(), vector.clone());
                results[i] = Some(vector);
            }
        }

        debug!(
            provider = self.inner.name(),
            batch_size = texts.len(),
            cache_hits = texts.len() - missing.len(),
            "embedded batch through cache"
        );
        Ok(results.into_iter().flatten().collect())
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_tag(&self) -> &str {
        self.inner.model_tag()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32])
        }

        fn dimensions(&self) -> usize {
            1
        }

        fn model_tag(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn repeated_text_hits_the_cache() {
        let inner = Arc::new(Counting::default());
        let cached = CachedEmbeddingProvider::new(inner.clone(), 2).unwrap();
        cached.embed("hello").await.unwrap();
        cached.embed("hello").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.model_tag(), "counting");
    }

    #[tokio::test]
    async fn batch_only_embeds_misses_in_order() {
        let inner = Arc::new(Counting::default());
        let cached = CachedEmbeddingProvider::new(inner.clone(), 8).unwrap();
        cached.embed("bb").await.unwrap();
        let vectors = cached.embed_batch(&["a", "bb", "ccc"]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached.len().await, 3);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let inner = Arc::new(Counting::default());
        let cached = CachedEmbeddingProvider::new(inner.clone(), 1).unwrap();
        cached.embed("a").await.unwrap();
        cached.embed("b").await.unwrap();
        cached.embed("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let inner = Arc::new(Counting::default());
        assert!(CachedEmbeddingProvider::new(inner, 0).is_err());
    }
}
