use thiserror::Error;

use crate::brain::BrainError;
use crate::ledger::LedgerError;

/// Failures that stop a drain or an ingestion run.
///
/// Everything that concerns a single candidate is absorbed into its ledger
/// row instead; only session and storage problems surface here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The remote session was rejected mid-drain. The pending set is intact
    /// and the drain can resume after re-authentication.
    #[error("simulation API session expired")]
    AuthExpired,

    #[error("re-authentication failed: {0}")]
    Reauthentication(#[from] BrainError),

    #[error("gave up after {attempts} consecutive re-authentications")]
    ReauthenticationExhausted { attempts: u32 },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
