//! Error types for the simulation API client.
//!
//! Each operation has its own error enum so callers can tell transient
//! throttling apart from real failures without string matching.

use thiserror::Error;

/// Session-level failures (building the HTTP client, authenticating).
#[derive(Debug, Error)]
pub enum BrainError {
    /// The authentication endpoint refused the credentials.
    #[error("authentication failed (status {status}): {message}")]
    AuthFailed { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Why a submission produced no job handle.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Too many requests or the account's concurrent simulation limit.
    #[error("submission rate limited")]
    RateLimited,

    #[error("submission rejected (status {status}): {details}")]
    Rejected { status: u16, details: String },

    #[error("submission accepted without a Location header")]
    NoHandleReturned,

    #[error("session is not authenticated")]
    Unauthorized,

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl SubmitError {
    /// Failures worth another submission attempt later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SubmitError::Rejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll rate limited")]
    RateLimited,

    #[error("session is not authenticated")]
    Unauthorized,

    #[error("unexpected poll response (status {status}): {details}")]
    Unexpected { status: u16, details: String },

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Metrics are not queryable yet.
    #[error("metrics not ready (status {status})")]
    NotReady { status: u16 },

    #[error("metrics fetch rate limited")]
    RateLimited,

    #[error("session is not authenticated")]
    Unauthorized,

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}
