//! The embedding backend seam.

use async_trait::async_trait;

use crate::error::Result;

/// Turns text into vectors of one embedding space.
///
/// Every vector belongs to the space named by
/// [`model_tag`](EmbeddingProvider::model_tag). The index refuses to mix
/// tags: after switching providers, [`RagPipeline::reembed_stale`]
/// regenerates the stored vectors.
///
/// Report failures that may succeed on retry (network errors, timeouts,
/// HTTP 5xx and 429) as
/// [`RagError::UpstreamUnavailable`](crate::RagError::UpstreamUnavailable);
/// the pipeline retries those with backoff.
///
/// ```rust,ignore
/// let vector = provider.embed("Where is my parcel?").await?;
/// assert_eq!(vector.len(), provider.dimensions());
/// ```
///
/// [`RagPipeline::reembed_stale`]: crate::RagPipeline::reembed_stale
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, returning one vector per input in input order.
    ///
    /// Falls back to one [`embed`](EmbeddingProvider::embed) call per text.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Length of every returned vector.
    fn dimensions(&self) -> usize;

    /// Model and version of the embedding space, e.g. `openai:text-embedding-3-small@1536`.
    fn model_tag(&self) -> &str;

    /// Backend name used in logs and errors.
    fn name(&self) -> &str {
        "embedding"
    }
}
