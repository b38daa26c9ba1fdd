//! Policy parameter schema.
//!
//! Every policy reads the same flat JSON object; each one only looks at
//! the keys it cares about and unknown keys are ignored. Values are typed
//! and range-checked up front so a policy never fails mid-run on a bad
//! parameter.

use std::collections::BTreeMap;
use std::time::Duration;

use faultline_signal::FaultKind;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("malformed policy parameters: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("parameter {key}: {reason}")]
    OutOfRange { key: String, reason: String },
}

/// Parameters shared by all explore policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyParams {
    /// Tick period of ticking policies, in milliseconds.
    pub interval: u64,
    /// Entity whose events the random policy serves first.
    pub prioritize: Option<String>,
    /// Random policy: delay each event through a time-bounded queue
    /// instead of ticking.
    pub time_bound: bool,
    /// Upper bound of the delay window, in milliseconds.
    pub max_bound: u64,
    /// Lower bound of the delay window, in milliseconds.
    pub min_bound: u64,
    /// Entity id -> kill rate in `0..=100`.
    pub kill_rate_per_entity: BTreeMap<String, u32>,
    /// Entity id -> shutdown rate in `0..=100`.
    pub shutdown_rate_per_entity: BTreeMap<String, u32>,
    /// ZK2172: function whose calls are held back.
    pub delayed_function: String,
    /// ZK2172: entity whose calls are held back.
    pub delayed_entity: String,
    /// ZK2172: ticks a held-back event waits before it may be picked.
    pub delay_ticks: u64,
    /// ZK2172: random picks per tick.
    pub max_retries: u32,
    /// Etcd: source port that marks a message as a peer response.
    pub peer_port: u16,
    pub dispatcher_workers: usize,
    pub dispatcher_capacity: usize,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            interval: 100,
            prioritize: None,
            time_bound: false,
            max_bound: 100,
            min_bound: 0,
            kill_rate_per_entity: BTreeMap::new(),
            shutdown_rate_per_entity: BTreeMap::new(),
            delayed_function: "deserializeSnapshot".to_string(),
            delayed_entity: "zksrv3".to_string(),
            delay_ticks: 1000,
            max_retries: 10,
            peer_port: 7001,
            dispatcher_workers: 4,
            dispatcher_capacity: 1024,
        }
    }
}

fn out_of_range(key: &str, reason: impl Into<String>) -> ParamError {
    ParamError::OutOfRange {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl PolicyParams {
    /// Parse and validate a raw parameter object. `null` yields defaults.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, ParamError> {
        let params: PolicyParams = if raw.is_null() {
            PolicyParams::default()
        } else {
            serde_json::from_value(raw.clone())?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        if self.interval == 0 {
            return Err(out_of_range("interval", "must be positive"));
        }
        if self.min_bound > self.max_bound {
            return Err(out_of_range(
                "minBound",
                format!("{} exceeds maxBound {}", self.min_bound, self.max_bound),
            ));
        }
        for (key, rates) in [
            ("killRatePerEntity", &self.kill_rate_per_entity),
            ("shutdownRatePerEntity", &self.shutdown_rate_per_entity),
        ] {
            if let Some((entity, rate)) = rates.iter().find(|(_, rate)| **rate > 100) {
                return Err(out_of_range(
                    key,
                    format!("rate {rate} for {entity} exceeds 100"),
                ));
            }
        }
        if self.max_retries == 0 {
            return Err(out_of_range("maxRetries", "must be positive"));
        }
        if self.dispatcher_workers == 0 {
            return Err(out_of_range("dispatcherWorkers", "must be positive"));
        }
        if self.dispatcher_capacity == 0 {
            return Err(out_of_range("dispatcherCapacity", "must be positive"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn min_bound(&self) -> Duration {
        Duration::from_millis(self.min_bound)
    }

    pub fn max_bound(&self) -> Duration {
        Duration::from_millis(self.max_bound)
    }

    pub fn fault_rates(&self) -> FaultRates {
        FaultRates {
            kill: self.kill_rate_per_entity.clone(),
            shutdown: self.shutdown_rate_per_entity.clone(),
        }
    }
}

/// Per-entity fault injection rates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultRates {
    kill: BTreeMap<String, u32>,
    shutdown: BTreeMap<String, u32>,
}

impl FaultRates {
    pub fn is_empty(&self) -> bool {
        self.kill.is_empty() && self.shutdown.is_empty()
    }

    /// Decide whether the next event of `entity` is resolved with a fault.
    ///
    /// A configured rate `r` injects when a draw `d` in `0..100` satisfies
    /// `r <= d`: rate 100 never injects, rate 0 always does. The kill rate
    /// is consulted first, then the shutdown rate.
    pub fn decide<R: Rng + ?Sized>(&self, entity: &str, rng: &mut R) -> Option<FaultKind> {
        for (rates, fault) in [(&self.kill, FaultKind::Kill), (&self.shutdown, FaultKind::Shutdown)] {
            if let Some(&rate) = rates.get(entity) {
                let draw: u32 = rng.gen_range(0..100);
                if rate <= draw {
                    return Some(fault);
                }
            }
        }
        None
    }
}
