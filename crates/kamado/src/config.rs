//! Orchestrator configuration.
//!
//! Values come from defaults, a JSON document, or `KAMADO_*` environment
//! variables. Environment loading goes through [`OrchestratorConfig::from_env_map`]
//! so it can be exercised without touching the process environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_KEYS: [&str; 8] = [
    "KAMADO_JOB_DEADLINE_SECS",
    "KAMADO_INPUT_PREFIX",
    "KAMADO_OUTPUT_PREFIX",
    "KAMADO_JOINED_PREFIX",
    "KAMADO_MAX_TOKENS",
    "KAMADO_MAX_UNITS",
    "KAMADO_RECORD_ID_FIELD",
    "KAMADO_INPUT_TEXT_FIELD",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds a submitted job may go without a terminal notification
    /// before it is marked timed out.
    pub job_deadline_secs: u64,

    /// Blob prefix for formatted request files.
    pub input_prefix: String,

    /// Blob prefix handed to the backend for job outputs.
    pub output_prefix: String,

    /// Blob prefix for consolidated run outputs.
    pub joined_prefix: String,

    /// `max_tokens` sent with text-generation requests.
    pub max_tokens: u32,

    /// Upper bound on the number of units a single run submits.
    pub max_units: Option<usize>,

    /// Field carrying the per-record correlation id.
    pub record_id_field: String,

    /// Field embedding requests read their text from.
    pub input_text_field: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_deadline_secs: 24 * 60 * 60,
            input_prefix: "batch_inputs_json".to_string(),
            output_prefix: "batch_outputs_json".to_string(),
            joined_prefix: "batch_outputs_joined".to_string(),
            max_tokens: 1024,
            max_units: None,
            record_id_field: "record_id".to_string(),
            input_text_field: "input_text".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_secs)
    }

    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline_secs = deadline.as_secs().max(1);
        self
    }

    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = Some(max_units);
        self
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = get("KAMADO_JOB_DEADLINE_SECS") {
            config.job_deadline_secs = parse_number("KAMADO_JOB_DEADLINE_SECS", &raw)?;
        }
        if let Some(raw) = get("KAMADO_MAX_TOKENS") {
            config.max_tokens = parse_number("KAMADO_MAX_TOKENS", &raw)?;
        }
        if let Some(raw) = get("KAMADO_MAX_UNITS") {
            config.max_units = Some(parse_number("KAMADO_MAX_UNITS", &raw)?);
        }
        if let Some(v) = get("KAMADO_INPUT_PREFIX") {
            config.input_prefix = v;
        }
        if let Some(v) = get("KAMADO_OUTPUT_PREFIX") {
            config.output_prefix = v;
        }
        if let Some(v) = get("KAMADO_JOINED_PREFIX") {
            config.joined_prefix = v;
        }
        if let Some(v) = get("KAMADO_RECORD_ID_FIELD") {
            config.record_id_field = v;
        }
        if let Some(v) = get("KAMADO_INPUT_TEXT_FIELD") {
            config.input_text_field = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_deadline_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "job_deadline_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_units == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_units".to_string(),
                value: "0".to_string(),
            });
        }
        for (name, value) in [
            ("input_prefix", &self.input_prefix),
            ("output_prefix", &self.output_prefix),
            ("joined_prefix", &self.joined_prefix),
            ("record_id_field", &self.record_id_field),
            ("input_text_field", &self.input_text_field),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
