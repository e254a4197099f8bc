//! Cleanup of OCR and markdown conversion artefacts before chunking.
//!
//! Scanned documents arrive as markdown with page headers, table-of-contents
//! leaders, inline image placeholders and table rows that carry no prose.
//! Left in place they dominate short chunks and skew embeddings.

use std::sync::LazyLock;

use regex::Regex;

static ARTEFACTS: LazyLock<Regex> = LazyLock::new(|| {
    let patterns = [
        // inline image placeholders emitted by the OCR step
        r"!\[img-\d+\.jpeg\]\(img-\d+\.jpeg\)",
        // page headers such as "## Page 3" or "## Trang 3 / 10"
        r"^##\s*(?:Trang|Page)?\s+\d+\s*(?:/\s*\d+)?\s*$",
        // table-of-contents lines: "1.2 Title ....... 14"
        r"^\d+(?:\.\d+)*\s+.+?\s+\.{3,}\s+\d+$",
        // markdown table rows
        r"^\|.+",
    ];
    Regex::new(&format!("(?mi){}", patterns.join("|"))).expect("artefact patterns are valid")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank-line pattern is valid"));

/// Strip layout artefacts from markdown text and collapse runs of blank lines.
///
/// Returns the cleaned text trimmed of leading and trailing whitespace; an
/// all-artefact input yields an empty string.
pub fn clean_markdown(markdown: &str) -> String {
    let cleaned = ARTEFACTS.replace_all(markdown, "");
    let cleaned = BLANK_RUNS.replace_all(&cleaned, "\n\n");
    cleaned.trim().to_string()
}
