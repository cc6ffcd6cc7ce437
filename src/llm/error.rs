//! Error types for the chat completion client.
//!
//! [`LlmError`] separates throttling, API errors, network failures and
//! answers that carry no text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header when present.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status, with the response body.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The response had no choice with message content.
    #[error("response contained no message content")]
    EmptyResponse,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}
