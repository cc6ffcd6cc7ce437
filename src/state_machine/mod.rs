mod job;
mod state;

pub use job::{Candidate, FailureReason, Job, JobOutcome, JobState, PendingSet};
pub use state::{JobEvent, RepairFailure, StateMachine, Transition};
