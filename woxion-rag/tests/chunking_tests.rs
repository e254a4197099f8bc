//! Property tests for sentence-aware chunking.

use proptest::prelude::*;
use woxion_rag::{Chunker, Document, GenerationId, SemanticChunker, estimate_tokens};

/// Text made of short sentences, occasionally separated by paragraph breaks.
fn arb_text() -> impl Strategy<Value = String> {
    let word = "[a-zA-Z0-9]{1,8}";
    let sentence = (proptest::collection::vec(word, 1..12), prop_oneof![
        Just("."),
        Just("?"),
        Just("!"),
        Just(""),
    ])
        .prop_map(|(words, stop)| format!("{}{stop}", words.join(" ")));
    let separator = prop_oneof![Just(" "), Just("  "), Just("\n"), Just("\n\n")];
    proptest::collection::vec((sentence, separator), 1..20).prop_map(|parts| {
        parts.into_iter().map(|(s, sep)| format!("{s}{sep}")).collect::<String>()
    })
}

/// Byte ranges of whitespace-separated words.
fn word_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                ranges.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push((s, text.len()));
    }
    ranges
}

/// Exclusive word indices at which a sentence ends: a word ending in `.`,
/// `!` or `?`, a blank line, or the end of the text.
fn sentence_ends(text: &str, words: &[(usize, usize)]) -> Vec<usize> {
    (0..words.len())
        .filter(|&i| {
            let word = &text[words[i].0..words[i].1];
            let last = i + 1 == words.len();
            last || word.ends_with(['.', '!', '?'])
                || text[words[i].1..words[i + 1].0].matches('\n').count() >= 2
        })
        .map(|i| i + 1)
        .collect()
}

mod prop_chunk_spans {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn spans_cover_text_within_limits(
            text in arb_text(),
            max_tokens in 2usize..16,
            overlap_seed in 0usize..16,
        ) {
            let overlap = overlap_seed % max_tokens;
            let chunker = SemanticChunker::new(max_tokens, overlap).unwrap();
            let spans = chunker.split(&text);
            prop_assert!(!spans.is_empty());

            for span in &spans {
                let slice = &text[span.start..span.end];
                prop_assert!(span.token_count <= max_tokens);
                prop_assert_eq!(estimate_tokens(slice), span.token_count);
                prop_assert_eq!(slice.trim(), slice);
            }

            for pair in spans.windows(2) {
                prop_assert!(pair[0].start < pair[1].start);
                prop_assert!(pair[0].end < pair[1].end);
                if pair[1].start < pair[0].end {
                    let shared = estimate_tokens(&text[pair[1].start..pair[0].end]);
                    prop_assert!(shared <= overlap, "shared {} > overlap {}", shared, overlap);
                }
            }

            for (start, end) in word_ranges(&text) {
                prop_assert!(
                    spans.iter().any(|s| s.start <= start && end <= s.end),
                    "word {:?} not covered",
                    &text[start..end],
                );
            }
        }

        #[test]
        fn overlap_is_full_unless_a_sentence_would_split(
            text in arb_text(),
            max_tokens in 2usize..16,
            overlap_seed in 0usize..16,
        ) {
            let overlap = overlap_seed % max_tokens;
            let spans = SemanticChunker::new(max_tokens, overlap).unwrap().split(&text);
            let words = word_ranges(&text);
            let ends = sentence_ends(&text, &words);
            let first_word = |byte: usize| words.iter().position(|w| w.0 == byte).unwrap();
            let last_word = |byte: usize| words.iter().position(|w| w.1 == byte).unwrap() + 1;

            for pair in spans.windows(2) {
                let (prev_start, prev_end) = (first_word(pair[0].start), last_word(pair[0].end));
                let next_start = first_word(pair[1].start);
                let shared = prev_end - next_start;
                let wanted = overlap.min(prev_end - prev_start - 1);

                // the sentence following the previous chunk
                let sentence_end = ends.iter().copied().find(|&e| e > prev_end).unwrap();
                let sentence_len = sentence_end - prev_end;
                let expected = if sentence_len <= max_tokens {
                    wanted.min(max_tokens - sentence_len)
                } else {
                    wanted
                };
                prop_assert_eq!(
                    shared,
                    expected,
                    "spans {:?} {:?}, next sentence {} tokens",
                    pair[0],
                    pair[1],
                    sentence_len,
                );
            }
        }

        #[test]
        fn chunking_is_deterministic(text in arb_text(), max_tokens in 2usize..16) {
            let chunker = SemanticChunker::new(max_tokens, max_tokens / 2).unwrap();
            let document = Document::new("doc", text);
            let first = chunker.chunk(&document, GenerationId(3)).unwrap();
            let second = chunker.chunk(&document, GenerationId(3)).unwrap();
            prop_assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(&second) {
                prop_assert_eq!(&a.id, &b.id);
                prop_assert_eq!(&a.text, &b.text);
                prop_assert_eq!((a.start, a.end), (b.start, b.end));
            }
            for (i, chunk) in first.iter().enumerate() {
                prop_assert_eq!(chunk.id.index as usize, i);
                prop_assert_eq!(chunk.id.generation, GenerationId(3));
            }
        }
    }
}

#[test]
fn three_sentences_with_overlap() {
    let document = Document::new(
        "pets",
        "The cat sat. It was happy. The dog ran far away quickly today.",
    );
    let chunks = SemanticChunker::new(6, 2).unwrap().chunk(&document, GenerationId(1)).unwrap();
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["The cat sat. It was happy.", "was happy. The dog ran far", "ran far away quickly today."]
    );
    assert_eq!(chunks[0].start, 0);
    assert_eq!(chunks[2].end, document.text.len());
}
