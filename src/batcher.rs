//! Ingestion: feeds a source's candidates into the orchestrator under the
//! concurrency window, skipping everything the ledger already holds.

use std::collections::HashSet;
use std::mem;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::brain::{SimulationApi, SubmitError};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::ledger::ResultLedger;
use crate::orchestrator::{DrainOutcome, JobOrchestrator};
use crate::repair::ExpressionRepairer;
use crate::report::RunReport;
use crate::state_machine::{Candidate, Job, PendingSet};

/// Session renewals tolerated inside one drain without a row being committed.
const MAX_REAUTH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    pub concurrency_window: usize,
    pub submit_retry_rounds: u32,
    pub submit_retry_delay: Duration,
    pub reauth_after_failures: u32,
}

impl BatcherSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            concurrency_window: config.concurrency_window.max(1),
            submit_retry_rounds: config.submit_retry_rounds,
            submit_retry_delay: Duration::from_secs(config.submit_retry_delay_secs),
            reauth_after_failures: config.reauth_after_failures.max(1),
        }
    }
}

pub struct IngestionBatcher<C, R> {
    orchestrator: JobOrchestrator<C, R>,
    settings: BatcherSettings,
    consecutive_failures: u32,
}

impl<C: SimulationApi, R: ExpressionRepairer> IngestionBatcher<C, R> {
    pub fn new(orchestrator: JobOrchestrator<C, R>, settings: BatcherSettings) -> Self {
        Self {
            orchestrator,
            settings,
            consecutive_failures: 0,
        }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator<C, R> {
        &self.orchestrator
    }

    /// Evaluate every candidate of one source that has no ledger row yet.
    ///
    /// Candidates are submitted in source order. Whenever the pending set is
    /// at the window the orchestrator drains it before the next submission.
    /// Candidates whose submission failed transiently are retried in rounds
    /// after the main pass; those still without a handle are returned as
    /// `unresolved`.
    pub async fn run(
        &mut self,
        source: &Path,
        candidates: Vec<Candidate>,
        ledger: &mut ResultLedger,
    ) -> Result<RunReport, OrchestratorError> {
        let mut report = RunReport::start(source, ledger.path(), candidates.len());
        let mut pending = PendingSet::new();
        let mut queued: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<Candidate> = HashSet::new();
        let mut interrupted = false;

        info!(
            source = %source.display(),
            candidates = candidates.len(),
            recorded = ledger.len(),
            window = self.settings.concurrency_window,
            "ingestion started"
        );

        for candidate in candidates {
            if ledger.contains(&candidate) || !seen.insert(candidate.clone()) {
                debug!(candidate = %candidate.preview(80), "already recorded, skipping");
                report.skipped += 1;
                self.orchestrator.progress().skipped(1);
                continue;
            }
            if self.orchestrator.shutdown_requested() || self.make_room(&mut pending, ledger).await? {
                interrupted = true;
                break;
            }
            self.submit_one(candidate, &mut pending, ledger, &mut queued, &mut report)
                .await?;
        }

        if !interrupted {
            interrupted = self.drain(&mut pending, ledger).await? == DrainOutcome::Interrupted;
        }

        let mut round = 0;
        while !interrupted && !queued.is_empty() && round < self.settings.submit_retry_rounds {
            round += 1;
            info!(round, queued = queued.len(), "retrying deferred submissions");
            if self.orchestrator.pause(self.settings.submit_retry_delay).await {
                interrupted = true;
                break;
            }
            for candidate in mem::take(&mut queued) {
                if ledger.contains(&candidate) {
                    continue;
                }
                if interrupted
                    || self.orchestrator.shutdown_requested()
                    || self.make_room(&mut pending, ledger).await?
                {
                    interrupted = true;
                    queued.push(candidate);
                    continue;
                }
                self.submit_one(candidate, &mut pending, ledger, &mut queued, &mut report)
                    .await?;
            }
            interrupted = interrupted || self.orchestrator.shutdown_requested();
            if !interrupted {
                interrupted = self.drain(&mut pending, ledger).await? == DrainOutcome::Interrupted;
            }
        }

        if !queued.is_empty() {
            warn!(count = queued.len(), "candidates left without a handle; they are retried on the next run");
        }
        if !pending.is_empty() {
            warn!(count = pending.len(), "jobs abandoned on shutdown; they are resubmitted on the next run");
        }

        report.unresolved = queued.into_iter().map(|c| c.as_str().to_string()).collect();
        report.interrupted = interrupted;
        report.finish(self.orchestrator.stats());
        info!(
            source = %source.display(),
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            unresolved = report.unresolved.len(),
            "ingestion finished"
        );
        Ok(report)
    }

    async fn submit_one(
        &mut self,
        candidate: Candidate,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
        queued: &mut Vec<Candidate>,
        report: &mut RunReport,
    ) -> Result<(), OrchestratorError> {
        match self.orchestrator.client().submit(&candidate).await {
            Ok(handle) => {
                self.consecutive_failures = 0;
                report.submitted += 1;
                self.orchestrator.progress().submitted(&candidate);
                self.orchestrator.track(pending, Job::new(candidate, handle));
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                debug!(
                    candidate = %candidate.preview(80),
                    error = %e,
                    failures = self.consecutive_failures,
                    "submission deferred"
                );
                queued.push(candidate);
                if matches!(e, SubmitError::Unauthorized)
                    || self.consecutive_failures >= self.settings.reauth_after_failures
                {
                    self.reauthenticate().await?;
                }
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures = 0;
                warn!(candidate = %candidate.preview(80), error = %e, "submission rejected");
                self.orchestrator.record_rejection(ledger, &candidate)
            }
        }
    }

    /// Drain until the pending set is below the window. Returns `true` on
    /// shutdown.
    async fn make_room(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
    ) -> Result<bool, OrchestratorError> {
        if pending.len() < self.settings.concurrency_window {
            return Ok(false);
        }
        debug!(pending = pending.len(), "window full, draining");
        Ok(self.drain(pending, ledger).await? == DrainOutcome::Interrupted)
    }

    /// Drain, renewing the session whenever the orchestrator reports it
    /// expired.
    async fn drain(
        &mut self,
        pending: &mut PendingSet,
        ledger: &mut ResultLedger,
    ) -> Result<DrainOutcome, OrchestratorError> {
        let mut attempts = 0;
        let mut committed = ledger.len();
        loop {
            match self.orchestrator.drain(pending, ledger).await {
                Err(OrchestratorError::AuthExpired) => {
                    // Only renewals with no committed row in between count.
                    if ledger.len() > committed {
                        attempts = 0;
                        committed = ledger.len();
                    }
                    attempts += 1;
                    if attempts > MAX_REAUTH_ATTEMPTS {
                        return Err(OrchestratorError::ReauthenticationExhausted {
                            attempts: MAX_REAUTH_ATTEMPTS,
                        });
                    }
                    warn!(attempt = attempts, pending = pending.len(), "session expired during drain");
                    self.reauthenticate().await?;
                }
                other => return other,
            }
        }
    }

    async fn reauthenticate(&mut self) -> Result<(), OrchestratorError> {
        info!("re-authenticating with the simulation API");
        self.orchestrator.client().reauthenticate().await?;
        self.consecutive_failures = 0;
        Ok(())
    }
}
