//! Grounded answer synthesis.
//!
//! The [`AnswerSynthesizer`] turns a [`RetrievalResult`] into a prompt that
//! fits the configured token budget, calls the generation backend, and maps
//! the `[n]` markers in the reply back to chunk ids.
//!
//! Budget order: the system prompt and the query are mandatory, conversation
//! history comes next (oldest turns dropped first), and retrieved context
//! fills whatever remains, highest-scored chunk first.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::chunking::estimate_tokens;
use crate::config::{BackendConfig, SynthesisConfig, UngroundedPolicy};
use crate::document::{Answer, ChunkId, Confidence, ConversationTurn, RetrievalResult, ScoredChunk};
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::retry::call_with_retry;

/// Heading placed above the numbered context passages.
pub const CONTEXT_HEADING: &str = "Context:";

/// Label placed in front of the user's question.
pub const QUESTION_LABEL: &str = "Question:";

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation pattern is valid"));

/// A prompt assembled within the token budget.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Full prompt text: system instructions, numbered context, question.
    pub text: String,
    /// Conversation turns forwarded to the backend, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Retrieved chunks that made it into the prompt; `[n]` refers to
    /// `included[n - 1]`.
    pub included: Vec<ScoredChunk>,
    /// Estimated tokens used by the text and history together.
    pub token_count: usize,
}

impl Prompt {
    /// Whether the prompt carries no retrieved context.
    pub fn is_ungrounded(&self) -> bool {
        self.included.is_empty()
    }
}

/// Composes grounded prompts and delegates to a [`GenerationProvider`].
pub struct AnswerSynthesizer {
    generator: Arc<dyn GenerationProvider>,
    config: SynthesisConfig,
    backend: BackendConfig,
}

impl AnswerSynthesizer {
    /// Create a synthesizer.
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        config: SynthesisConfig,
        backend: BackendConfig,
    ) -> Self {
        Self { generator, config, backend }
    }

    /// The synthesis configuration.
    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Assemble the prompt for `query` without calling the backend.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::BudgetExceeded`] if the system prompt and the
    /// query alone do not fit the budget.
    pub fn build_prompt(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
        history: &[ConversationTurn],
    ) -> Result<Prompt> {
        let budget = self.config.context_budget_tokens;
        let mandatory = estimate_tokens(&self.config.system_prompt)
            + estimate_tokens(QUESTION_LABEL)
            + estimate_tokens(query);
        if mandatory > budget {
            return Err(RagError::BudgetExceeded { required: mandatory, budget });
        }
        let mut remaining = budget - mandatory;

        let recent = &history[history.len().saturating_sub(self.config.max_history_turns)..];
        let mut kept_from = 0;
        let mut history_tokens: usize = recent.iter().map(turn_tokens).sum();
        while history_tokens > remaining {
            history_tokens -= turn_tokens(&recent[kept_from]);
            kept_from += 1;
        }
        let history = recent[kept_from..].to_vec();
        remaining -= history_tokens;

        let heading = estimate_tokens(CONTEXT_HEADING);
        let mut included = Vec::new();
        let mut context_tokens = 0;
        for item in retrieval {
            let cost = passage_tokens(included.len() + 1, &item.chunk.text)
                + if included.is_empty() { heading } else { 0 };
            if context_tokens + cost > remaining {
                break;
            }
            context_tokens += cost;
            included.push(item.clone());
        }

        let text = render(&self.config.system_prompt, &included, query);
        let token_count = mandatory + history_tokens + context_tokens;
        debug!(
            token_count,
            budget,
            passages = included.len(),
            dropped = retrieval.len() - included.len(),
            history_turns = history.len(),
            "built prompt"
        );
        Ok(Prompt { text, history, included, token_count })
    }

    /// Produce an answer for `query` from `retrieval`.
    pub async fn synthesize(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
        history: &[ConversationTurn],
    ) -> Result<Answer> {
        let cancel = CancellationToken::new();
        self.synthesize_cancellable(Uuid::new_v4(), query, retrieval, history, &cancel).await
    }

    /// Produce an answer for the query instance `query_id`, abandoning the
    /// backend call as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`RagError::BudgetExceeded`] if the mandatory prompt parts overflow.
    /// - [`RagError::UpstreamUnavailable`] if the backend keeps failing or
    ///   timing out.
    /// - [`RagError::Cancelled`] if `cancel` fires first.
    pub async fn synthesize_cancellable(
        &self,
        query_id: Uuid,
        query: &str,
        retrieval: &RetrievalResult,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let prompt = self.build_prompt(query, retrieval, history)?;
        let ungrounded = prompt.is_ungrounded();

        if ungrounded && self.config.ungrounded_policy == UngroundedPolicy::Refuse {
            debug!(%query_id, "no grounding available, refusing");
            return Ok(Answer {
                query_id,
                text: String::new(),
                citations: Vec::new(),
                confidence: Confidence::ungrounded(),
                ungrounded: true,
            });
        }

        let generator = &self.generator;
        let generated = call_with_retry(
            generator.name(),
            "generate",
            &self.backend.retry,
            self.backend.timeout(),
            cancel,
            || generator.generate(&prompt.text, &prompt.history),
        )
        .await?;

        let text = generated.text.trim().to_string();
        let (citations, confidence) = match prompt.included.first() {
            Some(top) => (
                cite(&text, &prompt.included),
                Confidence::from_signals(top.score, generated.confidence),
            ),
            None => (Vec::new(), Confidence::ungrounded()),
        };

        Ok(Answer { query_id, text, citations, confidence, ungrounded })
    }
}

fn turn_tokens(turn: &ConversationTurn) -> usize {
    // one token for the role label
    1 + estimate_tokens(&turn.content)
}

fn passage_tokens(number: usize, text: &str) -> usize {
    estimate_tokens(&format!("[{number}]")) + estimate_tokens(text)
}

fn render(system_prompt: &str, included: &[ScoredChunk], query: &str) -> String {
    let mut text = String::new();
    text.push_str(system_prompt.trim());
    text.push_str("\n\n");
    if !included.is_empty() {
        text.push_str(CONTEXT_HEADING);
        text.push('\n');
        for (i, item) in included.iter().enumerate() {
            let passage = item.chunk.text.split_whitespace().collect::<Vec<_>>().join(" ");
            text.push_str(&format!("[{}] {passage}\n", i + 1));
        }
        text.push('\n');
    }
    text.push_str(QUESTION_LABEL);
    text.push(' ');
    text.push_str(query.trim());
    text
}

/// Map `[n]` markers in `text` to the cited chunk ids, in first-appearance
/// order. Falls back to every included chunk when the text has no valid
/// marker.
fn cite(text: &str, included: &[ScoredChunk]) -> Vec<ChunkId> {
    let mut cited: Vec<ChunkId> = Vec::new();
    for captures in CITATION_MARKER.captures_iter(text) {
        let Some(number) = captures.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
            continue;
        };
        if let Some(item) = number.checked_sub(1).and_then(|i| included.get(i)) {
            if !cited.contains(&item.chunk.id) {
                cited.push(item.chunk.id.clone());
            }
        }
    }
    if cited.is_empty() {
        cited = included.iter().map(|item| item.chunk.id.clone()).collect();
    }
    cited
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::document::{Chunk, GenerationId};
    use crate::generation::Generated;

    struct Echo(&'static str);

    #[async_trait]
    impl GenerationProvider for Echo {
        async fn generate(&self, _prompt: &str, _history: &[ConversationTurn]) -> Result<Generated> {
            Ok(Generated::text(self.0))
        }
    }

    fn chunk(index: u32, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: ChunkId::new("doc", GenerationId(1), index),
                text: text.to_string(),
                start: 0,
                end: text.len(),
                token_count: estimate_tokens(text),
            },
            score,
        }
    }

    fn synthesizer(reply: &'static str, budget: usize) -> AnswerSynthesizer {
        let config = SynthesisConfig {
            context_budget_tokens: budget,
            system_prompt: "Answer briefly.".to_string(),
            ..SynthesisConfig::default()
        };
        AnswerSynthesizer::new(Arc::new(Echo(reply)), config, BackendConfig::default())
    }

    #[test]
    fn context_is_truncated_from_the_lowest_score() {
        // mandatory: 2 (system) + 1 (label) + 2 (query) = 5
        let s = synthesizer("", 5 + 1 + 4 + 4);
        let retrieval = RetrievalResult::from_unsorted(vec![
            chunk(0, "alpha beta gamma", 0.9),
            chunk(1, "delta epsilon zeta", 0.8),
            chunk(2, "eta theta iota", 0.7),
        ]);
        let prompt = s.build_prompt("which one?", &retrieval, &[]).unwrap();
        assert_eq!(prompt.included.len(), 2);
        assert!(prompt.text.contains("[1] alpha beta gamma"));
        assert!(prompt.text.contains("[2] delta epsilon zeta"));
        assert!(!prompt.text.contains("eta theta"));
        assert!(prompt.text.ends_with("Question: which one?"));
    }

    #[test]
    fn mandatory_parts_over_budget_fail() {
        let s = synthesizer("", 4);
        let err = s.build_prompt("a b c", &RetrievalResult::empty(), &[]).unwrap_err();
        assert!(matches!(err, RagError::BudgetExceeded { required: 6, budget: 4 }));
    }

    #[test]
    fn oldest_history_is_dropped_first() {
        let s = synthesizer("", 5 + 6);
        let history = vec![
            ConversationTurn::user("first question here"),
            ConversationTurn::assistant("an answer"),
            ConversationTurn::user("follow up"),
        ];
        let prompt = s.build_prompt("and now?", &RetrievalResult::empty(), &history).unwrap();
        assert_eq!(prompt.history, history[1..].to_vec());
    }

    #[test]
    fn markers_map_to_included_chunks() {
        let included = vec![chunk(0, "a", 0.9), chunk(1, "b", 0.8)];
        let cited = cite("See [2], also [2] and [1]. Not [7] or [0].", &included);
        assert_eq!(cited, vec![included[1].chunk.id.clone(), included[0].chunk.id.clone()]);
        let cited = cite("no markers", &included);
        assert_eq!(cited.len(), 2);
    }

    #[tokio::test]
    async fn empty_retrieval_is_ungrounded() {
        let s = synthesizer("I could not find that.", 100);
        let answer = s.synthesize("anything?", &RetrievalResult::empty(), &[]).await.unwrap();
        assert!(answer.ungrounded);
        assert!(answer.citations.is_empty());
        assert_eq!(answer.confidence, Confidence::ungrounded());
        assert_eq!(answer.text, "I could not find that.");
    }

    #[tokio::test]
    async fn refuse_policy_skips_the_backend() {
        let mut s = synthesizer("should not appear", 100);
        s.config.ungrounded_policy = UngroundedPolicy::Refuse;
        let answer = s.synthesize("anything?", &RetrievalResult::empty(), &[]).await.unwrap();
        assert!(answer.ungrounded);
        assert!(answer.text.is_empty());
    }

    #[tokio::test]
    async fn grounded_answer_cites_and_scores() {
        let s = synthesizer("Yes [1].", 100);
        let retrieval = RetrievalResult::from_unsorted(vec![chunk(0, "refunds take 5 days", 0.8)]);
        let answer = s.synthesize("refund time?", &retrieval, &[]).await.unwrap();
        assert!(!answer.ungrounded);
        assert_eq!(answer.citations, vec![ChunkId::new("doc", GenerationId(1), 0)]);
        assert!((answer.confidence.score - 0.8).abs() < 1e-6);
    }
}
