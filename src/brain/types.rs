//! Wire types for the simulation API.

use serde::{Deserialize, Serialize};

/// Remote job identifier and the URL to poll it at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub location: String,
}

impl JobHandle {
    /// Build a handle from a `Location` header; the id is the last path segment.
    pub fn from_location(location: &str) -> Option<Self> {
        let id = location.trim_end_matches('/').rsplit('/').next()?;
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            location: location.to_string(),
        })
    }
}

/// Status of a remote simulation as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Complete { alpha_id: Option<String> },
    Warning { alpha_id: Option<String> },
    /// `payload` is the raw response body, handed to the repair service.
    Error { status: String, payload: String },
}

/// In-sample performance metrics of a finished alpha.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub sharpe: Option<f64>,
    pub turnover: Option<f64>,
    pub fitness: Option<f64>,
    pub returns: Option<f64>,
    pub drawdown: Option<f64>,
    pub margin: Option<f64>,
}

/// Simulation settings sent with every submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationSettings {
    pub instrument_type: String,
    pub region: String,
    pub universe: String,
    pub delay: u32,
    pub decay: u32,
    pub neutralization: String,
    pub truncation: f64,
    pub pasteurization: String,
    pub unit_handling: String,
    pub nan_handling: String,
    pub language: String,
    pub visualization: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            instrument_type: "EQUITY".into(),
            region: "USA".into(),
            universe: "TOP3000".into(),
            delay: 1,
            decay: 0,
            neutralization: "SUBINDUSTRY".into(),
            truncation: 0.01,
            pasteurization: "ON".into(),
            unit_handling: "VERIFY".into(),
            nan_handling: "OFF".into(),
            language: "FASTEXPR".into(),
            visualization: false,
        }
    }
}

/// Body of `POST /simulations`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub settings: &'a SimulationSettings,
    pub regular: &'a str,
}

impl<'a> SimulationRequest<'a> {
    pub fn regular(settings: &'a SimulationSettings, expression: &'a str) -> Self {
        Self {
            kind: "REGULAR",
            settings,
            regular: expression,
        }
    }
}

/// Body returned when polling a simulation.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub alpha: Option<String>,
}

impl SimulationProgress {
    pub fn into_status(self, raw_body: String) -> RemoteStatus {
        match self.status.as_deref() {
            Some("COMPLETE") => RemoteStatus::Complete {
                alpha_id: self.alpha,
            },
            Some("WARNING") => RemoteStatus::Warning {
                alpha_id: self.alpha,
            },
            Some(status @ ("ERROR" | "FAIL")) => RemoteStatus::Error {
                status: status.to_string(),
                payload: raw_body,
            },
            _ => RemoteStatus::Pending,
        }
    }
}

/// Body of `GET /alphas/{id}`; only the in-sample block is used.
#[derive(Debug, Clone, Deserialize)]
pub struct AlphaDetails {
    #[serde(rename = "is", default)]
    pub in_sample: Metrics,
}
