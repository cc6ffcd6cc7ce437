use std::sync::Arc;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::error::{BrainError, FetchError, PollError, SubmitError};
use super::types::{
    AlphaDetails, JobHandle, Metrics, RemoteStatus, SimulationProgress, SimulationRequest,
    SimulationSettings,
};
use super::SimulationApi;
use crate::config::BrainConfig;
use crate::state_machine::Candidate;

/// Marker the API puts in the body when the account's concurrent simulation
/// limit is reached.
const LIMIT_MARKER: &str = "SIMULATION_LIMIT_EXCEEDED";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One authenticated cookie jar. Never mutated; re-authentication builds a new one.
struct Session {
    http: Client,
    generation: u64,
}

pub struct BrainClient {
    api_base: String,
    auth_url: String,
    credentials: Credentials,
    settings: SimulationSettings,
    session: RwLock<Arc<Session>>,
    // Serializes re-authentication; readers only take `session`.
    reauth: Mutex<()>,
}

impl BrainClient {
    /// Authenticate and return a ready client.
    pub async fn connect(
        api_base: impl Into<String>,
        auth_url: impl Into<String>,
        credentials: Credentials,
        settings: SimulationSettings,
    ) -> Result<Self, BrainError> {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        let auth_url = auth_url.into();
        let session = open_session(&auth_url, &credentials, 1).await?;
        Ok(Self {
            api_base,
            auth_url,
            credentials,
            settings,
            session: RwLock::new(Arc::new(session)),
            reauth: Mutex::new(()),
        })
    }

    pub async fn from_config(config: &BrainConfig) -> Result<Self, BrainError> {
        Self::connect(
            config.api_base.clone(),
            config.auth_url(),
            Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            config.simulation.clone(),
        )
        .await
    }

    async fn current(&self) -> Arc<Session> {
        self.session.read().await.clone()
    }

    fn absolute(&self, location: &str) -> String {
        if location.starts_with('/') {
            format!("{}{location}", self.api_base)
        } else {
            location.to_string()
        }
    }
}

fn build_http() -> Result<Client, BrainError> {
    let client = Client::builder()
        .cookie_store(true)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60))
        .build()?;
    Ok(client)
}

async fn open_session(
    auth_url: &str,
    credentials: &Credentials,
    generation: u64,
) -> Result<Session, BrainError> {
    let http = build_http()?;
    let response = http
        .post(auth_url)
        .basic_auth(&credentials.username, Some(&credentials.password))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(BrainError::AuthFailed {
            status: status.as_u16(),
            message,
        });
    }

    info!(generation, status = status.as_u16(), "authenticated with simulation API");
    Ok(Session { http, generation })
}

impl SimulationApi for BrainClient {
    async fn submit(&self, candidate: &Candidate) -> Result<JobHandle, SubmitError> {
        let session = self.current().await;
        let body = SimulationRequest::regular(&self.settings, candidate.as_str());
        let response = session
            .http
            .post(format!("{}/simulations", self.api_base))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SubmitError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SubmitError::RateLimited);
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            if details.contains(LIMIT_MARKER) {
                return Err(SubmitError::RateLimited);
            }
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                details,
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| self.absolute(v))
            .ok_or(SubmitError::NoHandleReturned)?;
        JobHandle::from_location(&location).ok_or(SubmitError::NoHandleReturned)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<RemoteStatus, PollError> {
        let session = self.current().await;
        let response = session
            .http
            .get(&handle.location)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PollError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(PollError::Unauthorized);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PollError::Unexpected {
                status: status.as_u16(),
                details: body,
            });
        }

        match serde_json::from_str::<SimulationProgress>(&body) {
            Ok(progress) => Ok(progress.into_status(body)),
            Err(e) => {
                // The API answers with an empty body while a job is queued.
                debug!(handle = %handle.id, error = %e, "unparsed progress body");
                Ok(RemoteStatus::Pending)
            }
        }
    }

    async fn fetch_metrics(&self, alpha_id: &str) -> Result<Metrics, FetchError> {
        let session = self.current().await;
        let response = session
            .http
            .get(format!("{}/alphas/{alpha_id}", self.api_base))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let details = response.json::<AlphaDetails>().await?;
                Ok(details.in_sample)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited),
            StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized),
            other => Err(FetchError::NotReady {
                status: other.as_u16(),
            }),
        }
    }

    async fn reauthenticate(&self) -> Result<(), BrainError> {
        let observed = self.current().await.generation;
        let _guard = self.reauth.lock().await;

        let current = self.current().await.generation;
        if current != observed {
            debug!(generation = current, "session already renewed by another caller");
            return Ok(());
        }

        let fresh = open_session(&self.auth_url, &self.credentials, current + 1).await?;
        *self.session.write().await = Arc::new(fresh);
        Ok(())
    }
}
