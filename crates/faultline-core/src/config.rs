//! Campaign configuration.
//!
//! ```json
//! {
//!   "explorePolicy": "DPOR",
//!   "explorePolicyParam": {"interval": 50},
//!   "storageType": "naive",
//!   "seed": 7,
//!   "drainTimeoutMs": 5000
//! }
//! ```
//!
//! Every key is optional.

use std::path::Path;
use std::time::Duration;

use faultline_explore::{ParamError, PolicyParams, POLICY_NAMES};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown explore policy: {0}")]
    UnknownPolicy(String),

    #[error("invalid explorePolicyParam: {0}")]
    Params(#[from] ParamError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExploreConfig {
    /// Registry name of the explore policy.
    pub explore_policy: String,
    /// Raw parameter object handed to the policy.
    pub explore_policy_param: serde_json::Value,
    /// History backend name.
    pub storage_type: String,
    /// Base seed; run `n` uses `seed + n`.
    pub seed: u64,
    /// How long a finished run keeps auto-accepting events before its
    /// remaining entities are cut off.
    pub drain_timeout_ms: u64,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            explore_policy: "random".to_string(),
            explore_policy_param: serde_json::Value::Object(Default::default()),
            storage_type: "naive".to_string(),
            seed: 42,
            drain_timeout_ms: 30_000,
        }
    }
}

impl ExploreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ExploreConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !POLICY_NAMES.contains(&self.explore_policy.as_str()) {
            return Err(ConfigError::UnknownPolicy(self.explore_policy.clone()));
        }
        PolicyParams::from_value(&self.explore_policy_param)?;
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Seed of the run with the given index.
    pub fn run_seed(&self, run_id: usize) -> u64 {
        self.seed.wrapping_add(run_id as u64)
    }
}
