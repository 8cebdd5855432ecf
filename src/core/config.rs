//! # Runtime configuration.
//!
//! [`Config`] centralizes the operational knobs of the preemption loop. It can be
//! built in code (public fields + [`Default`]) or loaded from TOML with
//! [`Config::from_toml_str`] / [`Config::from_file`].
//!
//! ## Sentinel values
//! - `max_concurrent = 0` → treated as 1 (the executor never runs unbounded)
//! - `heartbeat_interval = 0s` → no liveness reporter is started
//! - `heartbeat_timeout = 0s` → heartbeat deadline disabled; otherwise
//!   `heartbeat_interval` must be non-zero and shorter than it
//! - `start_to_close_timeout = 0s` → no per-attempt deadline
//! - `retry.max_attempts = 0` → unlimited attempts
//!
//! ## TOML layout
//! Every key is optional; durations are milliseconds.
//! ```toml
//! debounce_interval_ms = 60000
//! max_concurrent = 5
//! max_candidates = 10
//! heartbeat_interval_ms = 2000
//! start_to_close_timeout_ms = 300000
//! heartbeat_timeout_ms = 5000
//! signal_capacity = 64
//! bus_capacity = 1024
//! grace_ms = 30000
//! event_source = "preemptvisor"
//! workflow_name = "PreemptVMsWorkflow"
//!
//! [retry]
//! initial_interval_ms = 2000
//! backoff_coefficient = 2.0
//! max_interval_ms = 10000
//! max_attempts = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::policies::RetryPolicy;

/// Default workflow name reported in [`RunState`](crate::RunState).
pub const WORKFLOW_NAME: &str = "PreemptVMsWorkflow";

/// Configuration for the preemption runtime.
///
/// All fields are public. Prefer the helper accessors over sprinkling
/// sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Minimum time between two pipeline runs; triggers arriving sooner are skipped.
    pub debounce_interval: Duration,

    /// Ceiling on in-flight remote calls inside one stage fan-out.
    pub max_concurrent: usize,

    /// Discovered resources beyond this count are dropped (discovery order kept).
    pub max_candidates: usize,

    /// Retry contract applied to every stage.
    pub retry: RetryPolicy,

    /// Period of the liveness reporter running alongside a stage.
    pub heartbeat_interval: Duration,

    /// Upper bound on one stage attempt.
    pub start_to_close_timeout: Duration,

    /// Longest tolerated silence between two heartbeats of an attempt.
    pub heartbeat_timeout: Duration,

    /// Capacity of the trigger queue.
    pub signal_capacity: usize,

    /// Capacity of the event bus ring buffer.
    pub bus_capacity: usize,

    /// How long the worker waits for the loop to return after cancellation.
    pub grace: Duration,

    /// `source` attribute of outbound notification events.
    pub event_source: String,

    /// Name reported in the queryable state.
    pub workflow_name: String,
}

impl Config {
    /// Executor ceiling, never below 1.
    #[inline]
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent.max(1)
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    #[inline]
    pub fn signal_capacity_clamped(&self) -> usize {
        self.signal_capacity.max(1)
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(s)?;
        let cfg = file.into_config();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Rejects values no run could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_candidates == 0 {
            return Err(ConfigError::Invalid {
                field: "max_candidates",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.retry.backoff_coefficient.is_finite() || self.retry.backoff_coefficient < 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry.backoff_coefficient",
                reason: format!("{} is below 1.0", self.retry.backoff_coefficient),
            });
        }
        if self.retry.max_interval < self.retry.initial_interval {
            return Err(ConfigError::Invalid {
                field: "retry.max_interval",
                reason: "shorter than retry.initial_interval".to_string(),
            });
        }
        if !self.heartbeat_timeout.is_zero()
            && (self.heartbeat_interval.is_zero()
                || self.heartbeat_interval >= self.heartbeat_timeout)
        {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: format!(
                    "{:?} does not beat within heartbeat_timeout {:?}",
                    self.heartbeat_interval, self.heartbeat_timeout
                ),
            });
        }
        if self.workflow_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "workflow_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `debounce_interval = 60s`
    /// - `max_concurrent = 5`
    /// - `max_candidates = 10`
    /// - `retry = RetryPolicy::default()` (2s, x2.0, 10s cap, 3 attempts)
    /// - `heartbeat_interval = 2s`
    /// - `start_to_close_timeout = 5m`
    /// - `heartbeat_timeout = 5s`
    /// - `signal_capacity = 64`
    /// - `bus_capacity = 1024`
    /// - `grace = 30s`
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_secs(60),
            max_concurrent: 5,
            max_candidates: 10,
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(2),
            start_to_close_timeout: Duration::from_secs(5 * 60),
            heartbeat_timeout: Duration::from_secs(5),
            signal_capacity: 64,
            bus_capacity: 1024,
            grace: Duration::from_secs(30),
            event_source: "preemptvisor".to_string(),
            workflow_name: WORKFLOW_NAME.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    debounce_interval_ms: Option<u64>,
    max_concurrent: Option<usize>,
    max_candidates: Option<usize>,
    heartbeat_interval_ms: Option<u64>,
    start_to_close_timeout_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    signal_capacity: Option<usize>,
    bus_capacity: Option<usize>,
    grace_ms: Option<u64>,
    event_source: Option<String>,
    workflow_name: Option<String>,
    retry: FileRetry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileRetry {
    initial_interval_ms: Option<u64>,
    backoff_coefficient: Option<f64>,
    max_interval_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl FileConfig {
    fn into_config(self) -> Config {
        let d = Config::default();
        let ms = |v: Option<u64>, default: Duration| v.map_or(default, Duration::from_millis);

        Config {
            debounce_interval: ms(self.debounce_interval_ms, d.debounce_interval),
            max_concurrent: self.max_concurrent.unwrap_or(d.max_concurrent),
            max_candidates: self.max_candidates.unwrap_or(d.max_candidates),
            retry: RetryPolicy {
                initial_interval: ms(self.retry.initial_interval_ms, d.retry.initial_interval),
                backoff_coefficient: self
                    .retry
                    .backoff_coefficient
                    .unwrap_or(d.retry.backoff_coefficient),
                max_interval: ms(self.retry.max_interval_ms, d.retry.max_interval),
                max_attempts: self.retry.max_attempts.unwrap_or(d.retry.max_attempts),
            },
            heartbeat_interval: ms(self.heartbeat_interval_ms, d.heartbeat_interval),
            start_to_close_timeout: ms(self.start_to_close_timeout_ms, d.start_to_close_timeout),
            heartbeat_timeout: ms(self.heartbeat_timeout_ms, d.heartbeat_timeout),
            signal_capacity: self.signal_capacity.unwrap_or(d.signal_capacity),
            bus_capacity: self.bus_capacity.unwrap_or(d.bus_capacity),
            grace: ms(self.grace_ms, d.grace),
            event_source: self.event_source.unwrap_or(d.event_source),
            workflow_name: self.workflow_name.unwrap_or(d.workflow_name),
        }
    }
}
