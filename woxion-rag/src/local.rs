//! Offline backends that need no network access.
//!
//! [`HashingEmbeddingProvider`] maps words into a fixed number of buckets
//! (the hashing trick) and [`ExtractiveGenerator`] answers by quoting the
//! context passage that best overlaps the question. Neither needs a model
//! download, which makes them the default for tests, demos and air-gapped
//! deployments.

use std::collections::HashSet;
use std::hash::Hasher;

use async_trait::async_trait;
use fnv::FnvHasher;

use crate::document::ConversationTurn;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::generation::{Generated, GenerationProvider};
use crate::synthesizer::{CONTEXT_HEADING, QUESTION_LABEL};

/// Default number of hash buckets.
pub const DEFAULT_HASH_DIMENSIONS: usize = 4096;

/// 64-bit FNV-1a, stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).map(str::to_lowercase)
}

/// A bag-of-words embedder using feature hashing.
///
/// Each word increments the bucket its FNV-1a hash falls into; the vector is
/// L2-normalised. Texts sharing no words have similarity zero. Text without
/// any word embeds to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimensions: usize,
    model_tag: String,
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMENSIONS)
    }
}

impl HashingEmbeddingProvider {
    /// Create an embedder with `dimensions` buckets (at least one).
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self { dimensions, model_tag: format!("local-hash-v1-{dimensions}") }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in words(text) {
            let bucket = (fnv1a(word.as_bytes()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.vectorize(text)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_tag(&self) -> &str {
        &self.model_tag
    }

    fn name(&self) -> &str {
        "local-hash"
    }
}

/// Reply used when no passage shares a word with the question.
pub const NOT_FOUND_REPLY: &str = "I could not find the answer in the provided documents.";

/// A generator that quotes the best-matching context passage.
///
/// Reads the numbered passages and the question from the prompt, picks the
/// passage sharing the most distinct words with the question (lowest number
/// on ties) and returns it with its `[n]` marker. The confidence signal is
/// the fraction of question words found in that passage.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    /// Create a new extractive generator.
    pub fn new() -> Self {
        Self
    }
}

fn parse_prompt(prompt: &str) -> (Vec<(usize, &str)>, &str) {
    let mut passages = Vec::new();
    let mut question = "";
    let mut in_context = false;
    for line in prompt.lines() {
        if line == CONTEXT_HEADING {
            in_context = true;
        } else if let Some(rest) = line.strip_prefix(QUESTION_LABEL) {
            question = rest.trim();
            in_context = false;
        } else if in_context {
            let parsed = line
                .strip_prefix('[')
                .and_then(|rest| rest.split_once("] "))
                .and_then(|(n, text)| n.parse::<usize>().ok().map(|n| (n, text)));
            if let Some(passage) = parsed {
                passages.push(passage);
            }
        }
    }
    (passages, question)
}

#[async_trait]
impl GenerationProvider for ExtractiveGenerator {
    async fn generate(&self, prompt: &str, _history: &[ConversationTurn]) -> Result<Generated> {
        let (passages, question) = parse_prompt(prompt);
        let question_words: HashSet<String> = words(question).collect();

        let best = passages
            .iter()
            .map(|&(n, text)| {
                let passage_words: HashSet<String> = words(text).collect();
                (question_words.intersection(&passage_words).count(), n, text)
            })
            .filter(|&(overlap, _, _)| overlap > 0)
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));

        Ok(match best {
            Some((overlap, n, text)) => Generated {
                text: format!("{text} [{n}]"),
                confidence: Some(overlap as f32 / question_words.len() as f32),
            },
            None => Generated::text(NOT_FOUND_REPLY),
        })
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn fnv_matches_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[tokio::test]
    async fn shared_words_raise_similarity() {
        let embedder = HashingEmbeddingProvider::default();
        let query = embedder.embed("happy cat").await.unwrap();
        let close = embedder.embed("The cat sat. It was happy.").await.unwrap();
        let far = embedder.embed("ran far away quickly today.").await.unwrap();
        assert!((cosine(&query, &close) - 0.57735).abs() < 1e-4);
        assert!(cosine(&query, &far).abs() < 1e-6);
    }

    #[tokio::test]
    async fn punctuation_and_case_are_ignored() {
        let embedder = HashingEmbeddingProvider::new(64);
        let a = embedder.embed("Refund, please!").await.unwrap();
        let b = embedder.embed("refund please").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(embedder.embed("...").await.unwrap(), vec![0.0; 64]);
    }

    #[tokio::test]
    async fn quotes_the_best_passage() {
        let prompt = "Be helpful.\n\nContext:\n[1] Invoices are sent monthly.\n\
                      [2] Refunds are processed within five days.\n\nQuestion: How are refunds processed?";
        let generated = ExtractiveGenerator::new().generate(prompt, &[]).await.unwrap();
        assert_eq!(generated.text, "Refunds are processed within five days. [2]");
        assert!(generated.confidence.unwrap() > 0.5);
    }

    #[tokio::test]
    async fn no_overlap_means_not_found() {
        let prompt = "Be helpful.\n\nQuestion: anything?";
        let generated = ExtractiveGenerator::new().generate(prompt, &[]).await.unwrap();
        assert_eq!(generated.text, NOT_FOUND_REPLY);
        assert_eq!(generated.confidence, None);
    }
}
