//! Sentence-aware document chunking.
//!
//! This module provides the [`Chunker`] trait and [`SemanticChunker`], which
//! packs whole sentences into token-bounded chunks and copies a fixed number
//! of trailing tokens into the next chunk so that context spanning a chunk
//! boundary is retrievable from either side.
//!
//! A token is a maximal run of non-whitespace characters. A sentence ends at
//! a token whose last character (ignoring closing quotes and brackets) is
//! terminal punctuation, or at a paragraph break (a blank line).

use crate::config::ChunkingConfig;
use crate::document::{Chunk, ChunkId, Document, GenerationId};
use crate::error::{RagError, Result};

/// A strategy for splitting documents into chunks.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks belonging to `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidDocument`] if the document has no text.
    fn chunk(&self, document: &Document, generation: GenerationId) -> Result<Vec<Chunk>>;
}

/// Estimate the number of tokens in `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte span of one chunk within the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Number of tokens covered.
    pub token_count: usize,
}

/// Splits text at sentence and paragraph boundaries into chunks of at most
/// `max_tokens` tokens, overlapping by `overlap_tokens`.
///
/// A sentence is only split when it alone exceeds `max_tokens`. The overlap
/// is reduced when carrying it would force an extra split inside a sentence,
/// and when the previous chunk is not longer than the overlap itself.
///
/// # Example
///
/// ```rust,ignore
/// use woxion_rag::SemanticChunker;
///
/// let chunker = SemanticChunker::new(256, 32)?;
/// let spans = chunker.split("First sentence. Second sentence.");
/// ```
#[derive(Debug, Clone)]
pub struct SemanticChunker {
    max_tokens: usize,
    overlap_tokens: usize,
}

impl SemanticChunker {
    /// Create a new `SemanticChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if `max_tokens == 0` or
    /// `overlap_tokens >= max_tokens`.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if max_tokens == 0 {
            return Err(RagError::config("max_tokens", "must be greater than zero"));
        }
        if overlap_tokens >= max_tokens {
            return Err(RagError::config(
                "overlap_tokens",
                format!(
                    "overlap_tokens ({overlap_tokens}) must be less than max_tokens ({max_tokens})"
                ),
            ));
        }
        Ok(Self { max_tokens, overlap_tokens })
    }

    /// Create a chunker from the chunking section of a [`RagConfig`](crate::RagConfig).
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.max_tokens, config.overlap_tokens)
    }

    /// Compute chunk spans for `text`.
    ///
    /// Returns an empty `Vec` for text without any tokens.
    pub fn split(&self, text: &str) -> Vec<ChunkSpan> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let boundaries = sentence_boundaries(text, &tokens);
        plan_spans(tokens.len(), &boundaries, self.max_tokens, self.overlap_tokens)
            .into_iter()
            .map(|(first, last)| ChunkSpan {
                start: tokens[first].start,
                end: tokens[last - 1].end,
                token_count: last - first,
            })
            .collect()
    }
}

impl Chunker for SemanticChunker {
    fn chunk(&self, document: &Document, generation: GenerationId) -> Result<Vec<Chunk>> {
        let spans = self.split(&document.text);
        if spans.is_empty() {
            return Err(RagError::invalid_document(&document.id, "document contains no text"));
        }

        Ok(spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| Chunk {
                id: ChunkId::new(document.id.clone(), generation, i as u32),
                text: document.text[span.start..span.end].to_string(),
                start: span.start,
                end: span.end,
                token_count: span.token_count,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), current) {
            (true, Some(start)) => {
                tokens.push(Token { start, end: i });
                current = None;
            }
            (false, None) => current = Some(i),
            _ => {}
        }
    }
    if let Some(start) = current {
        tokens.push(Token { start, end: text.len() });
    }
    tokens
}

fn ends_sentence(token: &str) -> bool {
    let trimmed = token.trim_end_matches(['"', '\'', ')', ']', '\u{201d}', '\u{2019}', '\u{bb}']);
    trimmed.ends_with(['.', '!', '?', '\u{2026}', '\u{3002}', '\u{ff01}', '\u{ff1f}'])
}

/// Exclusive token indices at which a sentence ends, ascending, always
/// including the token count.
fn sentence_boundaries(text: &str, tokens: &[Token]) -> Vec<usize> {
    let mut boundaries = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let last = i + 1 == tokens.len();
        let paragraph_break =
            !last && text[token.end..tokens[i + 1].start].matches('\n').count() >= 2;
        if last || paragraph_break || ends_sentence(&text[token.start..token.end]) {
            boundaries.push(i + 1);
        }
    }
    boundaries
}

/// Largest boundary `b` with `after < b <= start + max_tokens`.
/// `boundaries` must be ascending.
fn furthest_boundary(
    boundaries: &[usize],
    start: usize,
    after: usize,
    max_tokens: usize,
) -> Option<usize> {
    let limit = start + max_tokens;
    let within = boundaries.partition_point(|&b| b <= limit);
    within.checked_sub(1).map(|i| boundaries[i]).filter(|&b| b > after)
}

/// Token ranges `[first, last)` for every chunk.
fn plan_spans(
    token_count: usize,
    boundaries: &[usize],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let first_end = furthest_boundary(boundaries, 0, 0, max_tokens)
        .unwrap_or_else(|| max_tokens.min(token_count));
    spans.push((0, first_end));

    let (mut prev_start, mut prev_end) = (0, first_end);
    while prev_end < token_count {
        let earliest = prev_end.saturating_sub(overlap_tokens).max(prev_start + 1);
        let fitted = (earliest..=prev_end).find_map(|start| {
            furthest_boundary(boundaries, start, prev_end, max_tokens).map(|end| (start, end))
        });
        // No sentence fits even without overlap: the next sentence is longer
        // than a chunk and gets hard-split at the token limit.
        let (start, end) =
            fitted.unwrap_or((earliest, (earliest + max_tokens).min(token_count)));
        spans.push((start, end));
        prev_start = start;
        prev_end = end;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(text: &str, max: usize, overlap: usize) -> Vec<String> {
        SemanticChunker::new(max, overlap)
            .unwrap()
            .split(text)
            .into_iter()
            .map(|s| text[s.start..s.end].to_string())
            .collect()
    }

    #[test]
    fn packs_whole_sentences() {
        let chunks = texts("One two. Three four. Five six.", 4, 0);
        assert_eq!(chunks, vec!["One two. Three four.", "Five six."]);
    }

    #[test]
    fn carries_overlap_when_the_next_sentence_still_fits() {
        let chunks = texts("A b. C d. E f.", 4, 1);
        assert_eq!(chunks, vec!["A b. C d.", "d. E f."]);
    }

    #[test]
    fn hard_splits_only_oversized_sentences() {
        let chunks = texts("Short. one two three four five six seven eight.", 4, 1);
        assert_eq!(chunks, vec!["Short.", "one two three four", "five six seven eight."]);
    }

    #[test]
    fn paragraph_breaks_end_sentences() {
        let chunks = texts("heading without stop\n\nbody text here", 3, 0);
        assert_eq!(chunks, vec!["heading without stop", "body text here"]);
    }

    #[test]
    fn respects_multibyte_boundaries() {
        let text = "Xin chào thế giới. Tiếng Việt có dấu.";
        for chunk in texts(text, 3, 1) {
            assert!(estimate_tokens(&chunk) <= 3);
        }
    }

    #[test]
    fn furthest_boundary_matches_linear_scan() {
        let boundaries = [2, 3, 7, 8, 15, 16, 30];
        for start in 0..32 {
            for after in 0..32 {
                for max_tokens in 1..10 {
                    let limit = start + max_tokens;
                    let expected =
                        boundaries.iter().copied().filter(|&b| b > after && b <= limit).max();
                    assert_eq!(
                        furthest_boundary(&boundaries, start, after, max_tokens),
                        expected,
                        "start={start} after={after} max={max_tokens}"
                    );
                }
            }
        }
    }

    #[test]
    fn long_documents_chunk_consistently() {
        let text = "Alpha beta gamma delta epsilon. ".repeat(20_000);
        let spans = SemanticChunker::new(256, 32).unwrap().split(&text);
        assert_eq!(spans.first().map(|s| s.start), Some(0));
        assert_eq!(spans.last().map(|s| s.end), Some(text.trim_end().len()));
        for pair in spans.windows(2) {
            assert!(pair[1].start < pair[0].end);
            assert!(pair[0].token_count <= 256);
        }
    }

    #[test]
    fn rejects_overlap_not_smaller_than_max() {
        assert!(matches!(SemanticChunker::new(4, 4), Err(RagError::Config { .. })));
        assert!(matches!(SemanticChunker::new(0, 0), Err(RagError::Config { .. })));
    }

    #[test]
    fn whitespace_only_document_is_invalid() {
        let chunker = SemanticChunker::new(8, 2).unwrap();
        let err = chunker.chunk(&Document::new("blank", " \n\t "), GenerationId(1)).unwrap_err();
        assert!(matches!(err, RagError::InvalidDocument { .. }));
    }
}
