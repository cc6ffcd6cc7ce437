//! Configuration loaded from `alpha-eval.toml`.
//!
//! [`AppConfig`] is built once at start and handed to the clients and the
//! orchestrator. Missing values fall back to defaults. Credentials and
//! endpoints can be overridden from the environment, which takes precedence
//! over the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::brain::SimulationSettings;

pub const DEFAULT_CONFIG_FILE: &str = "alpha-eval.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub brain: BrainConfig,

    #[serde(default)]
    pub repair: RepairConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Directory holding one `<source>_backtest.csv` ledger per source file.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Remote simulation API endpoint, credentials and simulation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub api_base: String,
    /// Defaults to `<api_base>/authentication`.
    pub auth_url: Option<String>,
    pub username: String,
    pub password: String,
    pub simulation: SimulationSettings,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.worldquantbrain.com".to_string(),
            auth_url: None,
            username: String::new(),
            password: String::new(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl BrainConfig {
    pub fn auth_url(&self) -> String {
        self.auth_url.clone().unwrap_or_else(|| {
            format!("{}/authentication", self.api_base.trim_end_matches('/'))
        })
    }
}

/// Expression repair through an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Write repaired expressions back into the source file.
    pub persist_to_source: bool,
    /// Overrides the built-in prompt. Uses `{{ fast_expression }}` and `{{ error_mes }}`.
    pub prompt_template: Option<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            persist_to_source: false,
            prompt_template: None,
        }
    }
}

/// Concurrency window, polling cadence and retry budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub concurrency_window: usize,
    pub poll_interval_secs: u64,
    pub metrics_fetch_retries: u32,
    pub metrics_fetch_interval_secs: u64,
    pub max_polls_per_job: u32,
    /// Failed submissions of a repaired expression before it is given up.
    pub resubmit_retries: u32,
    pub submit_retry_rounds: u32,
    pub submit_retry_delay_secs: u64,
    pub reauth_after_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_window: 15,
            poll_interval_secs: 5,
            metrics_fetch_retries: 10,
            metrics_fetch_interval_secs: 3,
            // One hour at the default cadence.
            max_polls_per_job: 720,
            resubmit_retries: 10,
            submit_retry_rounds: 3,
            submit_retry_delay_secs: 15,
            reauth_after_failures: 15,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("backtest_result")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            brain: BrainConfig::default(),
            repair: RepairConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            output_dir: default_output_dir(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from `alpha-eval.toml` in the working directory.
    /// An absent default file yields defaults; an absent explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut config = if path.exists() || required {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml(&contents).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overlay values from the environment. Empty variables are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("WORLDQUANT_ACCOUNT") {
            self.brain.username = v;
        }
        if let Some(v) = get("WORLDQUANT_PASSWORD") {
            self.brain.password = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.repair.api_key = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.repair.base_url = v;
        }
        if let Some(v) = get("REASONER_MODEL_NAME") {
            self.repair.model = v;
        }
    }

    /// Checks needed before talking to the remote API.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.concurrency_window == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.concurrency_window must be at least 1".into(),
            ));
        }
        if o.metrics_fetch_retries == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.metrics_fetch_retries must be at least 1".into(),
            ));
        }
        if o.max_polls_per_job == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_polls_per_job must be at least 1".into(),
            ));
        }
        if self.brain.username.is_empty() || self.brain.password.is_empty() {
            return Err(ConfigError::Invalid(
                "simulation API credentials missing (set WORLDQUANT_ACCOUNT and WORLDQUANT_PASSWORD)"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.orchestrator.concurrency_window, 15);
        assert_eq!(config.orchestrator.poll_interval_secs, 5);
        assert_eq!(config.orchestrator.metrics_fetch_retries, 10);
        assert_eq!(config.orchestrator.metrics_fetch_interval_secs, 3);
        assert_eq!(config.brain.api_base, "https://api.worldquantbrain.com");
        assert_eq!(
            config.brain.auth_url(),
            "https://api.worldquantbrain.com/authentication"
        );
        assert!(config.repair.enabled);
        assert!(!config.repair.persist_to_source);
        assert_eq!(config.output_dir, PathBuf::from("backtest_result"));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            output_dir = "results"

            [brain]
            username = "me@example.test"
            password = "pw"

            [brain.simulation]
            region = "CHN"
            universe = "TOP2000U"

            [orchestrator]
            concurrency_window = 5
        "#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("results"));
        assert_eq!(config.brain.username, "me@example.test");
        assert_eq!(config.brain.simulation.region, "CHN");
        assert_eq!(config.brain.simulation.universe, "TOP2000U");
        assert_eq!(config.brain.simulation.neutralization, "SUBINDUSTRY");
        assert_eq!(config.orchestrator.concurrency_window, 5);
        assert_eq!(config.orchestrator.poll_interval_secs, 5);
        assert_eq!(config.repair.temperature, 0.2);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = AppConfig::from_toml(
            r#"
            [brain]
            username = "file-user"
            password = "file-pw"

            [repair]
            model = "file-model"
        "#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("WORLDQUANT_ACCOUNT", "env-user"),
            ("WORLDQUANT_PASSWORD", ""),
            ("OPENAI_API_KEY", "sk-env"),
            ("REASONER_MODEL_NAME", "deepseek-reasoner"),
        ]);
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.brain.username, "env-user");
        assert_eq!(config.brain.password, "file-pw");
        assert_eq!(config.repair.api_key, "sk-env");
        assert_eq!(config.repair.model, "deepseek-reasoner");
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut config = AppConfig::default();
        config.brain.username = "u".into();
        config.brain.password = "p".into();
        assert!(config.validate().is_ok());

        config.orchestrator.concurrency_window = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_requires_credentials() {
        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            AppConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[orchestrator]\nconcurrency_window = 3\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.orchestrator.concurrency_window, 3);
    }
}
