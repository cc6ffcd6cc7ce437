//! Client for the remote simulation API.
//!
//! The orchestrator only sees the [`SimulationApi`] trait; [`BrainClient`]
//! is the HTTP implementation.

pub mod client;
pub mod error;
pub mod types;

pub use client::BrainClient;
pub use error::{BrainError, FetchError, PollError, SubmitError};
pub use types::{JobHandle, Metrics, RemoteStatus, SimulationSettings};

use crate::state_machine::Candidate;

/// Submit/poll/fetch operations against the remote job API.
pub trait SimulationApi {
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, SubmitError>;

    async fn poll(&self, handle: &JobHandle) -> Result<RemoteStatus, PollError>;

    async fn fetch_metrics(&self, alpha_id: &str) -> Result<Metrics, FetchError>;

    /// Replace the shared session with a freshly authenticated one.
    async fn reauthenticate(&self) -> Result<(), BrainError>;
}
