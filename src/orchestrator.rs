//! The job orchestrator: polls every live job until it reaches a terminal
//! state, runs the single repair cycle on simulation errors and commits one
//! ledger row per work item.
//!
//! All mutation of the pending set and the ledger happens on the caller's
//! task; there is no per-job task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::brain::{FetchError, PollError, RemoteStatus, SimulationApi, SubmitError};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::ledger::{ResultLedger, ResultRow};
use crate::repair::ExpressionRepairer;
use crate::report::RunStats;
use crate::source;
use crate::state_machine::{
    Candidate, FailureReason, Job, JobEvent, JobOutcome, PendingSet, RepairFailure, StateMachine,
    Transition,
};
use crate::ui::RunProgress;

/// Polling cadence and budgets, resolved from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub metrics_fetch_retries: u32,
    pub metrics_fetch_interval: Duration,
    pub max_polls_per_job: u32,
    pub resubmit_retries: u32,
    pub repair_enabled: bool,
    /// Write repaired expressions back into the source file.
    pub persist_repairs: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig, repair_enabled: bool, persist_repairs: bool) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            metrics_fetch_retries: config.metrics_fetch_retries.max(1),
            metrics_fetch_interval: Duration::from_secs(config.metrics_fetch_interval_secs),
            max_polls_per_job: config.max_polls_per_job,
            resubmit_retries: config.resubmit_retries.max(1),
            repair_enabled,
            persist_repairs,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The pending set is empty.
    Drained,
    /// Shutdown was requested; remaining jobs are still in the pending set.
    Interrupted,
}

pub struct JobOrchestrator<C, R> {
    client: Arc<C>,
    repairer: Arc<R>,
    machine: StateMachine,
    settings: OrchestratorSettings,
    source_path: Option<PathBuf>,
    shutdown: Option<watch::Receiver<bool>>,
    progress: RunProgress,
    stats: RunStats,
}

fn event_for(status: RemoteStatus) -> JobEvent {
    match status {
        RemoteStatus::Pending => JobEvent::Running,
        RemoteStatus::Complete { alpha_id } | RemoteStatus::Warning { alpha_id } => {
            JobEvent::Completed { alpha_id }
        }
        RemoteStatus::Error { status, payload } => JobEvent::Errored { status, payload },
    }
}

impl<C: SimulationApi, R: ExpressionRepairer> JobOrchestrator<C, R> {
    pub fn new(client: Arc<C>, repairer: Arc<R>, settings: OrchestratorSettings) -> Self {
        Self {
            client,
            repairer,
            machine: StateMachine::new(settings.repair_enabled, settings.max_polls_per_job),
            settings,
            source_path: None,
            shutdown: None,
            progress: RunProgress::hidden(),
            stats: RunStats::default(),
        }
    }

    /// Source file that repaired expressions are written back to.
    pub fn with_source_file(mut self, path: PathBuf) -> Self {
        self.source_path = Some(path);
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Start tracking a job whose submission just returned a handle.
    pub fn track(&self, pending: &mut PendingSet, mut job: Job) -> bool {
        self.machine.next(&mut job, JobEvent::Accepted);
        debug!(
            handle = %job.handle.id,
            candidate = %job.candidate.preview(80),
            repaired = job.repair_attempted,
            "tracking job"
        );
        let inserted = pending.insert(job);
        if !inserted {
            warn!("work item already has a live job; submission not tracked");
        }
        inserted
    }

    /// Record a candidate whose first submission was rejected outright.
    pub fn record_rejection(
        &mut self,
        ledger: &mut ResultLedger,
        candidate: &Candidate,
    ) -> Result<(), OrchestratorError> {
        let outcome = JobOutcome::Failed(FailureReason::SubmitRejected);
        self.commit(ledger, candidate, outcome)
    }

    /// Poll every pending job until the set is empty.
    ///
    /// Terminal jobs are removed and their row flushed before the next job
    /// is looked at. Returns [`OrchestratorError::AuthExpired`] with the
    /// pending set intact when the session is rejected.
    pub async fn drain(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
    ) -> Result<DrainOutcome, OrchestratorError> {
        while !pending.is_empty() {
            for handle_id in pending.handle_ids() {
                let Some(job) = pending.get(&handle_id) else {
                    continue;
                };
                let handle = job.handle.clone();

                if let Some(replacement) = job.replacement.clone() {
                    let Some(job) = pending.remove(&handle_id) else {
                        continue;
                    };
                    self.resubmit(pending, ledger, job, replacement).await?;
                    continue;
                }

                let event = match self.client.poll(&handle).await {
                    Ok(status) => event_for(status),
                    Err(PollError::RateLimited) => JobEvent::RateLimited,
                    Err(PollError::Unauthorized) => return Err(OrchestratorError::AuthExpired),
                    Err(e @ PollError::Unexpected { .. }) => {
                        warn!(handle = %handle_id, error = %e, "unexpected poll response");
                        JobEvent::PollFailed
                    }
                    Err(e) => {
                        warn!(handle = %handle_id, error = %e, "poll failed, retrying next pass");
                        continue;
                    }
                };
                self.advance(pending, ledger, &handle_id, event).await?;
            }

            if pending.is_empty() {
                break;
            }
            debug!(pending = pending.len(), "poll pass done");
            if self.pause(self.settings.poll_interval).await {
                info!(pending = pending.len(), "shutdown requested, leaving drain");
                return Ok(DrainOutcome::Interrupted);
            }
        }
        Ok(DrainOutcome::Drained)
    }

    async fn advance(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
        handle_id: &str,
        event: JobEvent,
    ) -> Result<(), OrchestratorError> {
        let mut event = event;
        loop {
            let Some(job) = pending.get_mut(handle_id) else {
                return Ok(());
            };

            match self.machine.next(job, event) {
                Transition::FetchMetrics { alpha_id } => {
                    event = self.fetch_metrics(&alpha_id).await?;
                }
                Transition::Repair { payload } => {
                    let Some(job) = pending.remove(handle_id) else {
                        return Ok(());
                    };
                    return self.repair(pending, ledger, job, payload).await;
                }
                Transition::Complete(outcome) => {
                    let Some(job) = pending.remove(handle_id) else {
                        return Ok(());
                    };
                    return self.commit(ledger, &job.original_candidate, outcome);
                }
                Transition::Stay | Transition::Next(_) | Transition::Replaced | Transition::Ignored => {
                    return Ok(());
                }
            }
        }
    }

    /// Fetch metrics for a completed alpha, retrying while they are not
    /// queryable. Throttled answers do not use up the budget.
    async fn fetch_metrics(&mut self, alpha_id: &str) -> Result<JobEvent, OrchestratorError> {
        let mut failures = 0;
        loop {
            match self.client.fetch_metrics(alpha_id).await {
                Ok(metrics) => return Ok(JobEvent::MetricsFetched(metrics)),
                Err(FetchError::Unauthorized) => return Err(OrchestratorError::AuthExpired),
                Err(FetchError::RateLimited) => {
                    debug!(alpha_id, "metrics fetch rate limited");
                }
                Err(e) => {
                    failures += 1;
                    debug!(alpha_id, attempt = failures, error = %e, "metrics not available yet");
                    if failures >= self.settings.metrics_fetch_retries {
                        warn!(alpha_id, attempts = failures, "metrics never became available");
                        return Ok(JobEvent::MetricsUnavailable);
                    }
                }
            }
            if self.pause(self.settings.metrics_fetch_interval).await {
                // Leave the job polling; it is picked up again on resume.
                return Ok(JobEvent::RateLimited);
            }
        }
    }

    async fn repair(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
        job: Job,
        payload: String,
    ) -> Result<(), OrchestratorError> {
        self.stats.repairs_attempted += 1;
        info!(
            handle = %job.handle.id,
            candidate = %job.candidate.preview(80),
            "simulation failed, requesting repair"
        );

        let replacement = match self.repairer.repair(&job.candidate, &payload).await {
            Ok(replacement) => replacement,
            Err(e) => {
                warn!(handle = %job.handle.id, error = %e, "repair failed");
                return self.settle(ledger, job, JobEvent::RepairFailed(RepairFailure::Service));
            }
        };

        if self.settings.persist_repairs {
            self.persist_replacement(&job.candidate, &replacement);
        }

        self.progress.repaired(&job.candidate, &replacement);
        self.resubmit(pending, ledger, job, replacement).await
    }

    /// Submit the repaired expression of a job in the repair cycle.
    ///
    /// Transient failures put the job back into the pending set with the
    /// replacement waiting for the next pass. Throttled and unauthorized
    /// answers do not count against `resubmit_retries`.
    async fn resubmit(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
        mut job: Job,
        replacement: Candidate,
    ) -> Result<(), OrchestratorError> {
        let e = match self.client.submit(&replacement).await {
            Ok(handle) => {
                self.machine.next(&mut job, JobEvent::Resubmitted);
                let next = Job::repaired(&job, replacement, handle);
                info!(old = %job.handle.id, new = %next.handle.id, "repaired expression resubmitted");
                self.track(pending, next);
                return Ok(());
            }
            Err(e) => e,
        };

        let counted = !matches!(e, SubmitError::RateLimited | SubmitError::Unauthorized);
        if counted {
            job.resubmit_failures += 1;
        }
        if !e.is_transient() || job.resubmit_failures >= self.settings.resubmit_retries {
            warn!(
                handle = %job.handle.id,
                error = %e,
                failures = job.resubmit_failures,
                "repaired expression could not be submitted"
            );
            return self.settle(ledger, job, JobEvent::RepairFailed(RepairFailure::Submit));
        }

        debug!(handle = %job.handle.id, error = %e, "resubmission deferred to next pass");
        let expired = matches!(e, SubmitError::Unauthorized);
        job.replacement = Some(replacement);
        pending.insert(job);
        if expired {
            return Err(OrchestratorError::AuthExpired);
        }
        Ok(())
    }

    // Best effort: a failure here never aborts the repair.
    fn persist_replacement(&self, old: &Candidate, new: &Candidate) {
        let Some(path) = &self.source_path else {
            return;
        };
        match source::replace_candidate(path, old, new) {
            Ok(true) => info!(path = %path.display(), "repaired expression written back to source"),
            Ok(false) => warn!(path = %path.display(), "failing expression not found in source, not rewritten"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not rewrite source"),
        }
    }

    fn settle(
        &mut self,
        ledger: &mut ResultLedger,
        mut job: Job,
        event: JobEvent,
    ) -> Result<(), OrchestratorError> {
        match self.machine.next(&mut job, event) {
            Transition::Complete(outcome) => self.commit(ledger, &job.original_candidate, outcome),
            other => {
                warn!(state = %job.state, transition = ?other, "job dropped without a terminal outcome");
                Ok(())
            }
        }
    }

    fn commit(
        &mut self,
        ledger: &mut ResultLedger,
        candidate: &Candidate,
        outcome: JobOutcome,
    ) -> Result<(), OrchestratorError> {
        let row = ResultRow::from_outcome(candidate, &outcome);
        if !ledger.append(&row)? {
            return Ok(());
        }

        match &outcome {
            JobOutcome::Succeeded(metrics) => {
                self.stats.succeeded += 1;
                info!(
                    candidate = %candidate.preview(80),
                    sharpe = ?metrics.sharpe,
                    fitness = ?metrics.fitness,
                    "work item succeeded"
                );
            }
            JobOutcome::Failed(reason) => {
                self.stats.failed += 1;
                warn!(candidate = %candidate.preview(80), %reason, "work item failed");
            }
        }
        self.progress.finished(candidate, &outcome);
        Ok(())
    }

    /// Sleep for `duration`; returns `true` if shutdown was requested.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        let Some(rx) = self.shutdown.as_mut() else {
            sleep(duration).await;
            return false;
        };
        if *rx.borrow() {
            return true;
        }
        let changed = tokio::select! {
            _ = sleep(duration) => false,
            Ok(()) = rx.changed() => true,
        };
        changed && *rx.borrow()
    }
}
