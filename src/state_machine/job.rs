use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::brain::{JobHandle, Metrics};

/// An alpha expression submitted for evaluation. Identity is the exact string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines and terminal notices.
    pub fn preview(&self, max_chars: usize) -> String {
        if self.0.chars().count() <= max_chars {
            self.0.clone()
        } else {
            let head: String = self.0.chars().take(max_chars).collect();
            format!("{head}...")
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Candidate {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Candidate {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Polling,
    Succeeded,
    FailedPermanent,
    Repairing,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedPermanent)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Polling => write!(f, "POLLING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::FailedPermanent => write!(f, "FAILED_PERMANENT"),
            JobState::Repairing => write!(f, "REPAIRING"),
        }
    }
}

/// Why a work item ended without metrics. The `Display` form is the
/// sentinel written to the ledger's `margin` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Remote simulation errored and no repair was attempted.
    Simulation { status: String },
    /// Completed without an alpha id to fetch metrics for.
    NoAlphaId,
    /// Metrics never became queryable within the retry budget.
    MetricsUnavailable,
    /// The job stayed pending for longer than the poll budget.
    PollTimeout,
    /// The original submission was rejected outright.
    SubmitRejected,
    /// The repair service could not produce a replacement.
    RepairService,
    /// The repaired expression could not be submitted or failed again.
    RepairSubmit,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Simulation { status } => write!(f, "FAILED:{status}"),
            FailureReason::NoAlphaId => write!(f, "FAILED:NO_ALPHA_ID"),
            FailureReason::MetricsUnavailable => write!(f, "FAILED:NO_METRICS"),
            FailureReason::PollTimeout => write!(f, "FAILED:TIMEOUT"),
            FailureReason::SubmitRejected => write!(f, "FAILED:SUBMIT"),
            FailureReason::RepairService => write!(f, "FIX_FAIL_LLM"),
            FailureReason::RepairSubmit => write!(f, "FIX_FAIL_SUBMIT"),
        }
    }
}

/// Terminal result of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded(Metrics),
    Failed(FailureReason),
}

/// A candidate under remote evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub candidate: Candidate,
    /// Ledger key of the work item; survives the repair cycle.
    pub original_candidate: Candidate,
    pub handle: JobHandle,
    pub repair_attempted: bool,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    /// Pending answers and failed polls seen so far; throttled polls do not count.
    pub polls: u32,
    /// Repaired expression still waiting for a successful submission.
    pub replacement: Option<Candidate>,
    /// Failed submissions of `replacement`, throttling excluded.
    pub resubmit_failures: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(candidate: Candidate, handle: JobHandle) -> Self {
        Self {
            original_candidate: candidate.clone(),
            candidate,
            handle,
            repair_attempted: false,
            state: JobState::Submitted,
            state_history: Vec::new(),
            polls: 0,
            replacement: None,
            resubmit_failures: 0,
            submitted_at: Utc::now(),
        }
    }

    /// The replacement job for the same work item after a repair.
    pub fn repaired(previous: &Job, candidate: Candidate, handle: JobHandle) -> Self {
        Self {
            original_candidate: previous.original_candidate.clone(),
            candidate,
            handle,
            repair_attempted: true,
            state: JobState::Submitted,
            state_history: Vec::new(),
            polls: 0,
            replacement: None,
            resubmit_failures: 0,
            submitted_at: Utc::now(),
        }
    }
}

/// Live jobs keyed by remote handle id.
///
/// At most one job per work item is held at a time.
#[derive(Debug, Default)]
pub struct PendingSet {
    jobs: HashMap<String, Job>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Adds a job. Returns `false` and drops nothing if the work item is
    /// already live under another handle.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.contains_work_item(&job.original_candidate) {
            return false;
        }
        self.jobs.insert(job.handle.id.clone(), job);
        true
    }

    pub fn contains_work_item(&self, original: &Candidate) -> bool {
        self.jobs.values().any(|j| &j.original_candidate == original)
    }

    pub fn get(&self, handle_id: &str) -> Option<&Job> {
        self.jobs.get(handle_id)
    }

    pub fn get_mut(&mut self, handle_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(handle_id)
    }

    pub fn remove(&mut self, handle_id: &str) -> Option<Job> {
        self.jobs.remove(handle_id)
    }

    /// Snapshot of the current handle ids, in a stable order.
    pub fn handle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
