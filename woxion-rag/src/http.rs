//! Shared HTTP plumbing for the remote backends.

use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::error;

use crate::error::RagError;

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Whether a failed request may succeed when repeated.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Map a transport failure. Every transport failure is transient.
pub(crate) fn send_error(backend: &str, err: reqwest::Error) -> RagError {
    error!(provider = backend, error = %err, "request failed");
    RagError::upstream(backend, format!("request failed: {err}"))
}

/// Map a response body that could not be decoded.
pub(crate) fn decode_error(backend: &str, err: reqwest::Error) -> RagError {
    error!(provider = backend, error = %err, "failed to parse response");
    RagError::Backend {
        backend: backend.to_string(),
        message: format!("failed to parse response: {err}"),
    }
}

/// Pass successful responses through; turn anything else into an error.
///
/// 5xx, 408 and 429 become [`RagError::UpstreamUnavailable`]; other statuses
/// become [`RagError::Backend`]. Both OpenAI and Gemini report failures as
/// `{"error": {"message": ...}}`, which is used as the detail when present.
pub(crate) async fn check_status(backend: &str, response: Response) -> Result<Response, RagError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail =
        serde_json::from_str::<ErrorResponse>(&body).map(|e| e.error.message).unwrap_or(body);
    error!(provider = backend, %status, "API error");

    let message = format!("API returned {status}: {detail}");
    if is_transient(status) {
        Err(RagError::upstream(backend, message))
    } else {
        Err(RagError::Backend { backend: backend.to_string(), message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(is_transient(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient(StatusCode::UNAUTHORIZED));
        assert!(!is_transient(StatusCode::BAD_REQUEST));
    }
}
