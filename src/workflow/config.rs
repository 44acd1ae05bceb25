//! Workflow tunables.
//!
//! Layering: `Default` → optional TOML file → `RECAP_*` environment variables.
//! Call `validate()` after the last layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunking::DEFAULT_TOKEN_BUDGET;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{var}={value:?} is not a valid value")]
    InvalidEnv { var: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Groups with at most this many sessions skip the pattern phases.
    pub small_group_threshold: usize,
    pub min_fetch_success_ratio: f64,
    pub min_summarize_success_ratio: f64,
    pub min_extract_success_ratio: f64,
    pub min_assign_success_ratio: f64,
    /// Share of raw patterns that must survive enrichment.
    pub min_enrichment_success_ratio: f64,
    /// Sessions shorter than this are skipped, not failed.
    pub min_session_duration_ms: i64,
    /// Token budget for the summaries of one extraction chunk.
    pub token_budget: usize,
    /// Sub-units of one phase in flight at once.
    pub max_concurrency: usize,
    /// Upper bound on one sub-unit, retries included.
    pub unit_timeout_secs: u64,
    pub intermediate_ttl_secs: u64,
    /// Calls per completion task before a schema failure is final.
    pub schema_attempts: u32,
    /// Event names dropped before summarization.
    pub ignored_events: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            small_group_threshold: 5,
            min_fetch_success_ratio: 0.5,
            min_summarize_success_ratio: 0.5,
            min_extract_success_ratio: 0.75,
            min_assign_success_ratio: 0.75,
            min_enrichment_success_ratio: 0.75,
            min_session_duration_ms: 5_000,
            token_budget: DEFAULT_TOKEN_BUDGET,
            max_concurrency: 8,
            unit_timeout_secs: 900,
            intermediate_ttl_secs: 24 * 60 * 60,
            schema_attempts: 2,
            ignored_events: [
                "$feature_flag_called",
                "$set",
                "$identify",
                "$groupidentify",
                "$web_vitals",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Overrides fields from `RECAP_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })
        }

        macro_rules! env_field {
            ($var:literal, $field:expr) => {
                if let Some(value) = lookup($var) {
                    $field = parse($var, value)?;
                }
            };
        }

        env_field!("RECAP_SMALL_GROUP_THRESHOLD", self.small_group_threshold);
        env_field!("RECAP_MIN_FETCH_SUCCESS_RATIO", self.min_fetch_success_ratio);
        env_field!("RECAP_MIN_SUMMARIZE_SUCCESS_RATIO", self.min_summarize_success_ratio);
        env_field!("RECAP_MIN_EXTRACT_SUCCESS_RATIO", self.min_extract_success_ratio);
        env_field!("RECAP_MIN_ASSIGN_SUCCESS_RATIO", self.min_assign_success_ratio);
        env_field!("RECAP_MIN_ENRICHMENT_SUCCESS_RATIO", self.min_enrichment_success_ratio);
        env_field!("RECAP_MIN_SESSION_DURATION_MS", self.min_session_duration_ms);
        env_field!("RECAP_TOKEN_BUDGET", self.token_budget);
        env_field!("RECAP_MAX_CONCURRENCY", self.max_concurrency);
        env_field!("RECAP_UNIT_TIMEOUT_SECS", self.unit_timeout_secs);
        env_field!("RECAP_INTERMEDIATE_TTL_SECS", self.intermediate_ttl_secs);
        env_field!("RECAP_SCHEMA_ATTEMPTS", self.schema_attempts);

        if let Some(value) = lookup("RECAP_IGNORED_EVENTS") {
            self.ignored_events = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratios = [
            ("min_fetch_success_ratio", self.min_fetch_success_ratio),
            ("min_summarize_success_ratio", self.min_summarize_success_ratio),
            ("min_extract_success_ratio", self.min_extract_success_ratio),
            ("min_assign_success_ratio", self.min_assign_success_ratio),
            ("min_enrichment_success_ratio", self.min_enrichment_success_ratio),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Invalid(format!(
                "max_concurrency must be within 1..={MAX_CONCURRENCY}, got {}",
                self.max_concurrency
            )));
        }
        if self.token_budget == 0 {
            return Err(ConfigError::Invalid("token_budget must be positive".into()));
        }
        if self.unit_timeout_secs == 0 {
            return Err(ConfigError::Invalid("unit_timeout_secs must be positive".into()));
        }
        if self.min_session_duration_ms < 0 {
            return Err(ConfigError::Invalid(
                "min_session_duration_ms cannot be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn intermediate_ttl(&self) -> Duration {
        Duration::from_secs(self.intermediate_ttl_secs)
    }
}
