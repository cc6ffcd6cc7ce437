use crate::brain::Metrics;

use super::job::{FailureReason, Job, JobOutcome, JobState};

/// What happened to a job since the last step.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Submission returned a handle.
    Accepted,
    /// The poll was throttled by the remote API.
    RateLimited,
    /// The remote job has not finished.
    Running,
    /// The poll got an answer that is neither a status nor throttling.
    PollFailed,
    /// Remote reported COMPLETE or WARNING.
    Completed { alpha_id: Option<String> },
    /// Remote reported an error for the simulation.
    Errored { status: String, payload: String },
    MetricsFetched(Metrics),
    MetricsUnavailable,
    /// The repaired expression was submitted under a new handle.
    Resubmitted,
    RepairFailed(RepairFailure),
}

/// Which link of the repair chain broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairFailure {
    Service,
    Submit,
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing to do until the next poll pass.
    Stay,
    /// Moved to a new non-terminal state.
    Next(JobState),
    /// Status is complete; the caller must fetch metrics for this alpha.
    FetchMetrics { alpha_id: String },
    /// The caller must run the repair cycle with this error payload.
    Repair { payload: String },
    /// The job is replaced by a new job for the same work item.
    Replaced,
    /// The work item is finished.
    Complete(JobOutcome),
    /// The event does not apply to the job's state.
    Ignored,
}

/// Drives a [`Job`] through its lifecycle.
///
/// ```text
/// SUBMITTED -> POLLING -> SUCCEEDED | FAILED_PERMANENT
///                 |
///                 +-> REPAIRING -> (replaced by a new POLLING job) | FAILED_PERMANENT
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    /// Whether a simulation error may enter the repair cycle.
    pub repair_enabled: bool,
    /// Pending answers tolerated before a job times out.
    pub max_polls: u32,
}

impl StateMachine {
    pub fn new(repair_enabled: bool, max_polls: u32) -> Self {
        Self {
            repair_enabled,
            max_polls,
        }
    }

    /// Compute the transition for `event` and apply it to `job`.
    ///
    /// Terminal states never change again. A rate-limited poll leaves the
    /// job untouched, including its poll counter.
    pub fn next(&self, job: &mut Job, event: JobEvent) -> Transition {
        if job.state.is_terminal() {
            return Transition::Ignored;
        }

        let transition = match (job.state, event) {
            (JobState::Submitted, JobEvent::Accepted) => Transition::Next(JobState::Polling),

            (JobState::Polling, JobEvent::RateLimited) => return Transition::Stay,
            (JobState::Polling, JobEvent::Running | JobEvent::PollFailed) => {
                job.polls += 1;
                if job.polls > self.max_polls {
                    Transition::Complete(JobOutcome::Failed(FailureReason::PollTimeout))
                } else {
                    Transition::Stay
                }
            }
            (JobState::Polling, JobEvent::Completed { alpha_id }) => match alpha_id {
                Some(alpha_id) => Transition::FetchMetrics { alpha_id },
                None => Transition::Complete(JobOutcome::Failed(FailureReason::NoAlphaId)),
            },
            (JobState::Polling, JobEvent::MetricsFetched(metrics)) => {
                Transition::Complete(JobOutcome::Succeeded(metrics))
            }
            (JobState::Polling, JobEvent::MetricsUnavailable) => {
                Transition::Complete(JobOutcome::Failed(FailureReason::MetricsUnavailable))
            }
            (JobState::Polling, JobEvent::Errored { status, payload }) => {
                if job.repair_attempted {
                    Transition::Complete(JobOutcome::Failed(FailureReason::RepairSubmit))
                } else if self.repair_enabled {
                    Transition::Repair { payload }
                } else {
                    Transition::Complete(JobOutcome::Failed(FailureReason::Simulation { status }))
                }
            }

            (JobState::Repairing, JobEvent::Resubmitted) => Transition::Replaced,
            (JobState::Repairing, JobEvent::RepairFailed(failure)) => {
                let reason = match failure {
                    RepairFailure::Service => FailureReason::RepairService,
                    RepairFailure::Submit => FailureReason::RepairSubmit,
                };
                Transition::Complete(JobOutcome::Failed(reason))
            }

            _ => return Transition::Ignored,
        };

        match &transition {
            Transition::Next(next_state) => {
                job.state_history.push(job.state);
                job.state = *next_state;
            }
            Transition::Repair { .. } => {
                job.state_history.push(job.state);
                job.state = JobState::Repairing;
            }
            Transition::Complete(outcome) => {
                job.state_history.push(job.state);
                job.state = match outcome {
                    JobOutcome::Succeeded(_) => JobState::Succeeded,
                    JobOutcome::Failed(_) => JobState::FailedPermanent,
                };
            }
            Transition::Stay
            | Transition::FetchMetrics { .. }
            | Transition::Replaced
            | Transition::Ignored => {}
        }

        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::JobHandle;

    fn handle(id: &str) -> JobHandle {
        JobHandle {
            id: id.to_string(),
            location: format!("https://example.test/simulations/{id}"),
        }
    }

    fn polling_job(machine: &StateMachine) -> Job {
        let mut job = Job::new("ts_rank(close, 20)".into(), handle("s1"));
        assert_eq!(
            machine.next(&mut job, JobEvent::Accepted),
            Transition::Next(JobState::Polling)
        );
        job
    }

    fn errored() -> JobEvent {
        JobEvent::Errored {
            status: "ERROR".into(),
            payload: r#"{"status":"ERROR","message":"unknown function"}"#.into(),
        }
    }

    fn metrics() -> Metrics {
        Metrics {
            sharpe: Some(1.2),
            fitness: Some(0.8),
            ..Default::default()
        }
    }

    #[test]
    fn happy_path_reaches_succeeded() {
        let machine = StateMachine::new(true, 10);
        let mut job = polling_job(&machine);

        let t = machine.next(&mut job, JobEvent::Running);
        assert_eq!(t, Transition::Stay);

        let t = machine.next(
            &mut job,
            JobEvent::Completed {
                alpha_id: Some("a1".into()),
            },
        );
        assert_eq!(
            t,
            Transition::FetchMetrics {
                alpha_id: "a1".into()
            }
        );
        assert_eq!(job.state, JobState::Polling);

        let t = machine.next(&mut job, JobEvent::MetricsFetched(metrics()));
        assert_eq!(t, Transition::Complete(JobOutcome::Succeeded(metrics())));
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(
            job.state_history,
            vec![JobState::Submitted, JobState::Polling]
        );
    }

    #[test]
    fn rate_limited_poll_changes_nothing() {
        let machine = StateMachine::new(true, 1);
        let mut job = polling_job(&machine);
        let history = job.state_history.clone();

        for _ in 0..5 {
            assert_eq!(machine.next(&mut job, JobEvent::RateLimited), Transition::Stay);
        }

        assert_eq!(job.state, JobState::Polling);
        assert_eq!(job.polls, 0);
        assert!(!job.repair_attempted);
        assert_eq!(job.state_history, history);
    }

    #[test]
    fn poll_budget_exhaustion_times_out() {
        let machine = StateMachine::new(true, 2);
        let mut job = polling_job(&machine);

        assert_eq!(machine.next(&mut job, JobEvent::Running), Transition::Stay);
        assert_eq!(machine.next(&mut job, JobEvent::Running), Transition::Stay);
        assert_eq!(
            machine.next(&mut job, JobEvent::Running),
            Transition::Complete(JobOutcome::Failed(FailureReason::PollTimeout))
        );
        assert_eq!(job.state, JobState::FailedPermanent);
    }

    #[test]
    fn failed_polls_use_the_poll_budget() {
        let machine = StateMachine::new(true, 2);
        let mut job = polling_job(&machine);

        assert_eq!(machine.next(&mut job, JobEvent::PollFailed), Transition::Stay);
        assert_eq!(machine.next(&mut job, JobEvent::Running), Transition::Stay);
        assert_eq!(
            machine.next(&mut job, JobEvent::PollFailed),
            Transition::Complete(JobOutcome::Failed(FailureReason::PollTimeout))
        );
        assert_eq!(job.polls, 3);
    }

    #[test]
    fn first_error_enters_repair() {
        let machine = StateMachine::new(true, 10);
        let mut job = polling_job(&machine);

        let t = machine.next(&mut job, errored());
        assert!(matches!(t, Transition::Repair { .. }));
        assert_eq!(job.state, JobState::Repairing);
    }

    #[test]
    fn error_after_repair_is_terminal() {
        let machine = StateMachine::new(true, 10);
        let first = polling_job(&machine);
        let mut job = Job::repaired(&first, "ts_rank(x,20)".into(), handle("s2"));
        machine.next(&mut job, JobEvent::Accepted);

        let t = machine.next(&mut job, errored());
        assert_eq!(
            t,
            Transition::Complete(JobOutcome::Failed(FailureReason::RepairSubmit))
        );
        assert_eq!(job.state, JobState::FailedPermanent);
    }

    #[test]
    fn error_with_repair_disabled_keeps_remote_status() {
        let machine = StateMachine::new(false, 10);
        let mut job = polling_job(&machine);

        let t = machine.next(&mut job, errored());
        assert_eq!(
            t,
            Transition::Complete(JobOutcome::Failed(FailureReason::Simulation {
                status: "ERROR".into()
            }))
        );
    }

    #[test]
    fn completion_without_alpha_id_fails() {
        let machine = StateMachine::new(true, 10);
        let mut job = polling_job(&machine);

        let t = machine.next(&mut job, JobEvent::Completed { alpha_id: None });
        assert_eq!(
            t,
            Transition::Complete(JobOutcome::Failed(FailureReason::NoAlphaId))
        );
    }

    #[test]
    fn repair_failures_map_to_sentinels() {
        let machine = StateMachine::new(true, 10);

        let mut job = polling_job(&machine);
        machine.next(&mut job, errored());
        assert_eq!(
            machine.next(&mut job, JobEvent::RepairFailed(RepairFailure::Service)),
            Transition::Complete(JobOutcome::Failed(FailureReason::RepairService))
        );

        let mut job = polling_job(&machine);
        machine.next(&mut job, errored());
        assert_eq!(
            machine.next(&mut job, JobEvent::RepairFailed(RepairFailure::Submit)),
            Transition::Complete(JobOutcome::Failed(FailureReason::RepairSubmit))
        );
    }

    #[test]
    fn repairing_job_is_replaced_on_resubmission() {
        let machine = StateMachine::new(true, 10);
        let mut job = polling_job(&machine);
        machine.next(&mut job, errored());

        assert_eq!(machine.next(&mut job, JobEvent::Resubmitted), Transition::Replaced);
        assert_eq!(job.state, JobState::Repairing);
    }

    #[test]
    fn terminal_state_ignores_everything() {
        let machine = StateMachine::new(true, 10);
        let mut job = polling_job(&machine);
        machine.next(&mut job, JobEvent::MetricsFetched(metrics()));

        assert_eq!(machine.next(&mut job, errored()), Transition::Ignored);
        assert_eq!(machine.next(&mut job, JobEvent::Running), Transition::Ignored);
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        let machine = StateMachine::new(true, 10);
        let mut job = Job::new("rank(close)".into(), handle("s1"));

        assert_eq!(machine.next(&mut job, JobEvent::Running), Transition::Ignored);
        assert_eq!(job.state, JobState::Submitted);
    }
}
