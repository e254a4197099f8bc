//! Error types for the `woxion-rag` crate.

use thiserror::Error;

/// Errors that can occur in RAG operations.
///
/// Variants fall into three groups: caller-fixable input or configuration
/// problems ([`InvalidDocument`](RagError::InvalidDocument),
/// [`Config`](RagError::Config), [`ModelMismatch`](RagError::ModelMismatch),
/// [`DimensionMismatch`](RagError::DimensionMismatch),
/// [`NotFound`](RagError::NotFound)), transient backend failures
/// ([`UpstreamUnavailable`](RagError::UpstreamUnavailable)), and per-call
/// fatal outcomes ([`BudgetExceeded`](RagError::BudgetExceeded),
/// [`Backend`](RagError::Backend), [`Cancelled`](RagError::Cancelled)).
#[derive(Debug, Error)]
pub enum RagError {
    /// The document text is empty or could not be decoded as text.
    #[error("Invalid document '{document_id}': {reason}")]
    InvalidDocument {
        /// The offending document.
        document_id: String,
        /// Why the document was rejected.
        reason: String,
    },

    /// A configuration validation error.
    #[error("Configuration error ({parameter}): {message}")]
    Config {
        /// The configuration parameter that failed validation.
        parameter: String,
        /// A description of the failure.
        message: String,
    },

    /// The embedding model does not match the index's active model.
    #[error("Model mismatch: index expects '{expected}', embedder produces '{found}'")]
    ModelMismatch {
        /// The model tag the index is configured for.
        expected: String,
        /// The model tag that was offered.
        found: String,
    },

    /// A vector does not have the dimensionality of the index.
    #[error("Dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch {
        /// The dimensionality fixed by the index.
        expected: usize,
        /// The dimensionality of the offending vector.
        found: usize,
    },

    /// A backend call failed or timed out. Safe to retry with backoff.
    #[error("Upstream unavailable ({backend}): {message}")]
    UpstreamUnavailable {
        /// The backend that failed.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// A backend rejected the request outright (authentication, malformed
    /// request). Retrying will not help.
    #[error("Backend error ({backend}): {message}")]
    Backend {
        /// The backend that rejected the request.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// The query plus minimal system prompt do not fit the context budget.
    #[error("Context budget exceeded: {required} tokens required, budget is {budget}")]
    BudgetExceeded {
        /// Tokens needed by the mandatory prompt parts.
        required: usize,
        /// The configured context budget.
        budget: usize,
    },

    /// The caller abandoned the operation.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The referenced document does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),
}

impl RagError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::UpstreamUnavailable { .. })
    }

    pub(crate) fn config(parameter: &str, message: impl Into<String>) -> Self {
        RagError::Config { parameter: parameter.to_string(), message: message.into() }
    }

    pub(crate) fn upstream(backend: &str, message: impl Into<String>) -> Self {
        RagError::UpstreamUnavailable { backend: backend.to_string(), message: message.into() }
    }

    pub(crate) fn invalid_document(document_id: &str, reason: impl Into<String>) -> Self {
        RagError::InvalidDocument { document_id: document_id.to_string(), reason: reason.into() }
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upstream_failures_are_retryable() {
        assert!(RagError::upstream("local", "timed out").is_retryable());
        assert!(!RagError::config("top_k", "must be positive").is_retryable());
        assert!(!RagError::BudgetExceeded { required: 10, budget: 5 }.is_retryable());
        assert!(
            !RagError::Backend { backend: "OpenAI".into(), message: "401".into() }.is_retryable()
        );
    }

    #[test]
    fn messages_carry_the_offending_parameter() {
        let err = RagError::config("overlap_tokens", "must be less than max_tokens");
        assert_eq!(
            err.to_string(),
            "Configuration error (overlap_tokens): must be less than max_tokens"
        );
    }
}
