//! Data types for documents, chunks, embeddings, retrieval results and answers.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// Descriptive metadata attached to a [`Document`] at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    /// Optional URI pointing to the original source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// When the document was handed to the pipeline.
    pub ingested_at: DateTime<Utc>,
    /// The user or tenant that uploaded the document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Free-form key-value attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self { source_uri: None, ingested_at: Utc::now(), owner: None, attributes: HashMap::new() }
    }
}

/// A source document. Immutable once handed to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier for the document.
    pub id: String,
    /// The text content of the document.
    pub text: String,
    /// Metadata describing where the document came from.
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Create a document with default metadata (ingested now, no owner).
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), metadata: DocumentMetadata::default() }
    }

    /// Create a document from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidDocument`] if the bytes are not valid UTF-8.
    pub fn from_bytes(id: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let id = id.into();
        let text = std::str::from_utf8(bytes).map_err(|e| {
            RagError::invalid_document(&id, format!("text is not valid UTF-8: {e}"))
        })?;
        Ok(Self::new(id, text))
    }

    /// Create a document from OCR or markdown output, stripping layout
    /// artefacts first (see [`clean_markdown`](crate::normalize::clean_markdown)).
    pub fn from_markdown(id: impl Into<String>, markdown: &str) -> Self {
        Self::new(id, crate::normalize::clean_markdown(markdown))
    }

    /// Set the source URI.
    pub fn with_source_uri(mut self, uri: impl Into<String>) -> Self {
        self.metadata.source_uri = Some(uri.into());
        self
    }

    /// Set the owning user or tenant.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.metadata.owner = Some(owner.into());
        self
    }

    /// Add a free-form attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.attributes.insert(key.into(), value.into());
        self
    }
}

/// Identifies one ingestion of a document. Strictly increasing across the
/// lifetime of a [`ChunkStore`](crate::store::ChunkStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Stable identifier of a [`Chunk`]: owning document, generation, and
/// position within that generation.
///
/// Ordering is lexicographic over those three fields and is used as the
/// tie-breaker for equal retrieval scores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    /// The owning document.
    pub document_id: String,
    /// The ingestion generation the chunk belongs to.
    pub generation: GenerationId,
    /// Sequence index within the generation.
    pub index: u32,
}

impl ChunkId {
    /// Create a chunk identifier.
    pub fn new(document_id: impl Into<String>, generation: GenerationId, index: u32) -> Self {
        Self { document_id: document_id.into(), generation, index }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.document_id, self.generation, self.index)
    }
}

/// A bounded span of a [`Document`]'s text used as a retrieval unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Unique identifier for the chunk.
    pub id: ChunkId,
    /// The text content of the chunk, copied from the document.
    pub text: String,
    /// Byte offset of the first character in the document text.
    pub start: usize,
    /// Byte offset one past the last character in the document text.
    pub end: usize,
    /// Estimated number of tokens in `text`.
    pub token_count: usize,
}

impl Chunk {
    /// The owning document's identifier.
    pub fn document_id(&self) -> &str {
        &self.id.document_id
    }

    /// Character distance between two spans of the same document; zero when
    /// they overlap or touch.
    pub fn distance_to(&self, other: &Chunk) -> usize {
        let (first, second) = if self.start <= other.start { (self, other) } else { (other, self) };
        second.start.saturating_sub(first.end)
    }
}

/// A vector embedding of a chunk's text, tagged with the model that made it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    /// The embedded chunk.
    pub chunk_id: ChunkId,
    /// The embedding vector.
    pub vector: Vec<f32>,
    /// Model/version tag of the embedding backend.
    pub model_tag: String,
}

/// A retrieved [`Chunk`] paired with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Orders by descending score, then ascending chunk id.
pub(crate) fn rank_order(a_score: f32, a_id: &ChunkId, b_score: f32, b_id: &ChunkId) -> Ordering {
    b_score.partial_cmp(&a_score).unwrap_or(Ordering::Equal).then_with(|| a_id.cmp(b_id))
}

/// Ranked output of retrieval.
///
/// Always sorted by descending score with ties broken by ascending
/// [`ChunkId`]. An empty result is a valid "no grounding available" outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    items: Vec<ScoredChunk>,
}

impl RetrievalResult {
    /// Build a result from scored chunks in any order.
    pub fn from_unsorted(mut items: Vec<ScoredChunk>) -> Self {
        items.sort_by(|a, b| rank_order(a.score, &a.chunk.id, b.score, &b.chunk.id));
        Self { items }
    }

    /// An empty result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The ranked items.
    pub fn items(&self) -> &[ScoredChunk] {
        &self.items
    }

    /// Iterate over the ranked items.
    pub fn iter(&self) -> std::slice::Iter<'_, ScoredChunk> {
        self.items.iter()
    }

    /// Number of retrieved chunks.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was retrieved.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Highest score, if any chunk was retrieved.
    pub fn top_score(&self) -> Option<f32> {
        self.items.first().map(|item| item.score)
    }

    /// Whether the given chunk is part of this result.
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.items.iter().any(|item| &item.chunk.id == id)
    }

    /// Consume the result, returning the ranked items.
    pub fn into_items(self) -> Vec<ScoredChunk> {
        self.items
    }
}

impl<'a> IntoIterator for &'a RetrievalResult {
    type Item = &'a ScoredChunk;
    type IntoIter = std::slice::Iter<'a, ScoredChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Coarse confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    /// Score of at least 0.75.
    High,
    /// Score of at least 0.5.
    Medium,
    /// Anything lower, including ungrounded answers.
    Low,
}

/// Confidence indicator attached to an [`Answer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    /// Combined score in `[0, 1]`.
    pub score: f32,
    /// Bucketed level derived from `score`.
    pub level: ConfidenceLevel,
}

impl Confidence {
    /// Combine the top retrieval score with an optional model signal.
    pub fn from_signals(top_score: f32, model_signal: Option<f32>) -> Self {
        let retrieval = top_score.clamp(0.0, 1.0);
        let score = match model_signal {
            Some(signal) => (retrieval + signal.clamp(0.0, 1.0)) / 2.0,
            None => retrieval,
        };
        Self { score, level: Self::level_for(score) }
    }

    /// Confidence of an answer with no grounding.
    pub fn ungrounded() -> Self {
        Self { score: 0.0, level: ConfidenceLevel::Low }
    }

    fn level_for(score: f32) -> ConfidenceLevel {
        if score >= 0.75 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// A synthesized answer with its grounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Identifier of the query instance that produced this answer.
    pub query_id: Uuid,
    /// The generated text.
    pub text: String,
    /// Cited chunks, in citation order. Always a subset of the chunks that
    /// made it into the prompt.
    pub citations: Vec<ChunkId>,
    /// Confidence indicator.
    pub confidence: Confidence,
    /// `true` when no retrieved material backed the answer.
    pub ungrounded: bool,
}

/// Who said a [`ConversationTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user.
    User,
    /// The assistant.
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One message of prior conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ConversationTurn {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Restricts retrieval to a subset of ingested documents.
///
/// Both filters apply when set: a chunk is in scope only if its document is
/// listed (when `document_ids` is set) and owned by `owner` (when set).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentScope {
    /// Allowed document identifiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<BTreeSet<String>>,
    /// Required document owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl DocumentScope {
    /// Scope to an explicit set of documents.
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { document_ids: Some(ids.into_iter().map(Into::into).collect()), owner: None }
    }

    /// Scope to documents uploaded by `owner`.
    pub fn owner(owner: impl Into<String>) -> Self {
        Self { document_ids: None, owner: Some(owner.into()) }
    }

    /// Whether a document with the given id and owner is in scope.
    pub fn admits(&self, document_id: &str, owner: Option<&str>) -> bool {
        let id_ok = self.document_ids.as_ref().is_none_or(|ids| ids.contains(document_id));
        let owner_ok = match &self.owner {
            Some(required) => owner == Some(required.as_str()),
            None => true,
        };
        id_ok && owner_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(doc: &str, index: u32, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: ChunkId::new(doc, GenerationId(1), index),
                text: String::new(),
                start: 0,
                end: 0,
                token_count: 0,
            },
            score,
        }
    }

    #[test]
    fn retrieval_result_breaks_ties_by_chunk_id() {
        let result = RetrievalResult::from_unsorted(vec![
            scored("b", 0, 0.5),
            scored("a", 1, 0.5),
            scored("a", 0, 0.9),
        ]);
        let ids: Vec<String> = result.iter().map(|s| s.chunk.id.to_string()).collect();
        assert_eq!(ids, vec!["a@g1#0", "a@g1#1", "b@g1#0"]);
        assert_eq!(result.top_score(), Some(0.9));
    }

    #[test]
    fn from_bytes_rejects_invalid_utf8() {
        let err = Document::from_bytes("scan", &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, RagError::InvalidDocument { .. }));
    }

    #[test]
    fn scope_intersects_filters() {
        let scope = DocumentScope { owner: Some("alice".into()), ..DocumentScope::documents(["a"]) };
        assert!(scope.admits("a", Some("alice")));
        assert!(!scope.admits("a", Some("bob")));
        assert!(!scope.admits("b", Some("alice")));
        assert!(DocumentScope::default().admits("anything", None));
    }

    #[test]
    fn confidence_levels() {
        assert_eq!(Confidence::from_signals(0.9, None).level, ConfidenceLevel::High);
        assert_eq!(Confidence::from_signals(0.9, Some(0.2)).level, ConfidenceLevel::Medium);
        assert_eq!(Confidence::from_signals(-0.3, None).score, 0.0);
        assert_eq!(Confidence::ungrounded().level, ConfidenceLevel::Low);
    }

    #[test]
    fn chunk_distance_is_zero_when_spans_overlap() {
        let mut a = scored("d", 0, 0.0).chunk;
        let mut b = scored("d", 1, 0.0).chunk;
        a.start = 0;
        a.end = 10;
        b.start = 8;
        b.end = 20;
        assert_eq!(a.distance_to(&b), 0);
        b.start = 14;
        assert_eq!(b.distance_to(&a), 4);
    }
}
