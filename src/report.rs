use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counters the orchestrator keeps while draining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub succeeded: usize,
    pub failed: usize,
    pub repairs_attempted: usize,
}

/// Summary of one source file's run, printed at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub source: PathBuf,
    pub ledger: PathBuf,
    pub total: usize,
    pub skipped: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub repairs_attempted: usize,
    /// Candidates that never got a handle; they have no ledger row and are
    /// picked up again by the next run.
    pub unresolved: Vec<String>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunReport {
    pub fn start(source: &Path, ledger: &Path, total: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            source: source.to_path_buf(),
            ledger: ledger.to_path_buf(),
            total,
            skipped: 0,
            submitted: 0,
            succeeded: 0,
            failed: 0,
            repairs_attempted: 0,
            unresolved: Vec::new(),
            interrupted: false,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    /// Stamp completion time and copy the orchestrator's counters.
    pub fn finish(&mut self, stats: RunStats) {
        let now = Utc::now();
        self.succeeded = stats.succeeded;
        self.failed = stats.failed;
        self.repairs_attempted = stats.repairs_attempted;
        self.completed_at = now;
        self.duration_ms = (now - self.started_at).num_milliseconds();
    }
}
