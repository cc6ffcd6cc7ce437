//! Scripted in-memory stand-ins for the simulation API and repair service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::brain::{
    BrainError, FetchError, JobHandle, Metrics, PollError, RemoteStatus, SimulationApi,
    SubmitError,
};
use crate::ledger::ResultRow;
use crate::llm::LlmError;
use crate::repair::{ExpressionRepairer, RepairError};
use crate::state_machine::Candidate;

/// One scripted poll answer.
#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    RateLimited,
    Unauthorized,
    Complete(Option<&'static str>),
    Warning(Option<&'static str>),
    Error,
    /// A non-2xx answer that is not a status, e.g. a vanished job.
    Unexpected,
    Transport,
}

/// One scripted submission answer; the default is success.
#[derive(Debug, Clone, Copy)]
pub enum Submit {
    Ok,
    RateLimited,
    NoHandle,
    Rejected,
    Unauthorized,
}

#[derive(Default)]
struct State {
    polls: HashMap<String, VecDeque<Step>>,
    submits: HashMap<String, VecDeque<Submit>>,
    metrics: HashMap<String, Metrics>,
    fetch_not_ready: HashMap<String, u32>,
    fetch_rate_limited: HashMap<String, u32>,
    expire_at_polls: HashSet<usize>,
    shutdown_on_submit: Option<(String, watch::Sender<bool>)>,
    handles: HashMap<String, String>,
    finished_handles: HashSet<String>,
    submitted: Vec<String>,
    poll_count: usize,
    fetch_calls: usize,
    live: usize,
    max_live: usize,
    next_id: u32,
    reauths: u32,
    sessions_rejected: bool,
}

#[derive(Default)]
pub struct FakeBrain {
    state: Mutex<State>,
}

impl FakeBrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll answers for `expression`; the last one repeats.
    pub fn script(&self, expression: &str, steps: Vec<Step>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .polls
            .insert(expression.to_string(), steps.into());
        self
    }

    /// Submission answers for `expression`; once used up submissions succeed.
    pub fn submits(&self, expression: &str, answers: Vec<Submit>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .submits
            .insert(expression.to_string(), answers.into());
        self
    }

    pub fn metrics(&self, alpha_id: &str, metrics: Metrics) -> &Self {
        self.state
            .lock()
            .unwrap()
            .metrics
            .insert(alpha_id.to_string(), metrics);
        self
    }

    /// The first `times` fetches of `alpha_id` answer "not ready".
    pub fn not_ready(&self, alpha_id: &str, times: u32) -> &Self {
        self.state
            .lock()
            .unwrap()
            .fetch_not_ready
            .insert(alpha_id.to_string(), times);
        self
    }

    /// The first `times` fetches of `alpha_id` are throttled.
    pub fn rate_limited_fetches(&self, alpha_id: &str, times: u32) -> &Self {
        self.state
            .lock()
            .unwrap()
            .fetch_rate_limited
            .insert(alpha_id.to_string(), times);
        self
    }

    /// The session expires on these poll calls (1-based, counted across all jobs).
    pub fn expire_at_polls(&self, polls: &[usize]) -> &Self {
        self.state.lock().unwrap().expire_at_polls = polls.iter().copied().collect();
        self
    }

    /// Request shutdown as soon as `expression` is submitted successfully.
    pub fn shutdown_on_submit(&self, expression: &str, tx: watch::Sender<bool>) -> &Self {
        self.state.lock().unwrap().shutdown_on_submit = Some((expression.to_string(), tx));
        self
    }

    /// Every poll answers unauthorized, even after re-authentication.
    pub fn reject_sessions(&self) -> &Self {
        self.state.lock().unwrap().sessions_rejected = true;
        self
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().poll_count
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }

    pub fn reauths(&self) -> u32 {
        self.state.lock().unwrap().reauths
    }
}

impl SimulationApi for FakeBrain {
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, SubmitError> {
        let mut s = self.state.lock().unwrap();
        let answer = s
            .submits
            .get_mut(candidate.as_str())
            .and_then(|q| q.pop_front())
            .unwrap_or(Submit::Ok);

        match answer {
            Submit::Ok => {}
            Submit::RateLimited => return Err(SubmitError::RateLimited),
            Submit::NoHandle => return Err(SubmitError::NoHandleReturned),
            Submit::Unauthorized => return Err(SubmitError::Unauthorized),
            Submit::Rejected => {
                return Err(SubmitError::Rejected {
                    status: 400,
                    details: "invalid".into(),
                });
            }
        }

        s.next_id += 1;
        let id = format!("sim{}", s.next_id);
        s.handles.insert(id.clone(), candidate.as_str().to_string());
        s.submitted.push(candidate.as_str().to_string());
        s.live += 1;
        s.max_live = s.max_live.max(s.live);
        if let Some((expr, tx)) = &s.shutdown_on_submit {
            if expr == candidate.as_str() {
                let _ = tx.send(true);
            }
        }
        Ok(JobHandle {
            location: format!("https://fake.test/simulations/{id}"),
            id,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<RemoteStatus, PollError> {
        let mut s = self.state.lock().unwrap();
        s.poll_count += 1;
        if s.sessions_rejected || s.expire_at_polls.contains(&s.poll_count) {
            return Err(PollError::Unauthorized);
        }
        let expression = s.handles.get(&handle.id).cloned().unwrap_or_default();
        let step = match s.polls.get_mut(&expression) {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or(Step::Pending),
            Some(q) => q.front().cloned().unwrap_or(Step::Pending),
            None => Step::Complete(Some("default")),
        };

        let status = match step {
            Step::Pending => RemoteStatus::Pending,
            Step::RateLimited => return Err(PollError::RateLimited),
            Step::Unauthorized => return Err(PollError::Unauthorized),
            Step::Unexpected => {
                return Err(PollError::Unexpected {
                    status: 404,
                    details: "simulation not found".into(),
                });
            }
            Step::Transport => return Err(PollError::Transport(transport_error())),
            Step::Complete(alpha) => RemoteStatus::Complete {
                alpha_id: alpha.map(str::to_string),
            },
            Step::Warning(alpha) => RemoteStatus::Warning {
                alpha_id: alpha.map(str::to_string),
            },
            Step::Error => RemoteStatus::Error {
                status: "ERROR".into(),
                payload: format!(r#"{{"status":"ERROR","regular":"{expression}"}}"#),
            },
        };

        if !matches!(status, RemoteStatus::Pending) && s.finished_handles.insert(handle.id.clone()) {
            s.live -= 1;
        }
        Ok(status)
    }

    async fn fetch_metrics(&self, alpha_id: &str) -> Result<Metrics, FetchError> {
        let mut s = self.state.lock().unwrap();
        s.fetch_calls += 1;
        if let Some(remaining) = s.fetch_rate_limited.get_mut(alpha_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::RateLimited);
            }
        }
        if let Some(remaining) = s.fetch_not_ready.get_mut(alpha_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::NotReady { status: 404 });
            }
        }
        Ok(s.metrics.get(alpha_id).cloned().unwrap_or_default())
    }

    async fn reauthenticate(&self) -> Result<(), BrainError> {
        let mut s = self.state.lock().unwrap();
        s.reauths += 1;
        // A fresh session clears scripted auth failures.
        for q in s.polls.values_mut() {
            q.retain(|step| !matches!(step, Step::Unauthorized));
        }
        Ok(())
    }
}

/// Repairs by lookup table; unknown expressions fail like a broken model call.
#[derive(Default)]
pub struct FakeRepairer {
    fixes: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRepairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(mut self, from: &str, to: &str) -> Self {
        self.fixes.insert(from.to_string(), to.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ExpressionRepairer for FakeRepairer {
    async fn repair(&self, candidate: &Candidate, _error_payload: &str) -> Result<Candidate, RepairError> {
        self.calls.lock().unwrap().push(candidate.as_str().to_string());
        match self.fixes.get(candidate.as_str()) {
            Some(fixed) => Ok(Candidate::new(fixed.clone())),
            None => Err(RepairError::Service(LlmError::ApiError {
                status: 500,
                message: "no fix".into(),
            })),
        }
    }
}

/// A real `reqwest::Error`, built without touching the network.
pub fn transport_error() -> reqwest::Error {
    reqwest::Client::new()
        .get("not a url")
        .build()
        .unwrap_err()
}

pub fn read_rows(path: &Path) -> Vec<ResultRow> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.deserialize().map(|r| r.unwrap()).collect()
}

pub fn sample_metrics() -> Metrics {
    Metrics {
        sharpe: Some(1.2),
        turnover: Some(0.25),
        fitness: Some(0.8),
        returns: Some(0.09),
        drawdown: Some(0.04),
        margin: Some(0.0006),
    }
}
