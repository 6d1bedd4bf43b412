//! Orchestrator configuration.
//!
//! Configuration can be built three ways:
//!
//! - [`OrchestratorConfig::default`] plus the `with_*` setters,
//! - [`OrchestratorConfig::from_map`] from a key/value mapping,
//! - [`OrchestratorConfig::from_env`] from `RATCHET_*` environment variables
//!   (a `.env` file is loaded first when present).
//!
//! Durations in mappings and environment variables are either integer
//! milliseconds (`250`) or a number with a `ms`, `s`, `m` or `h` suffix
//! (`250ms`, `30s`, `5m`).

use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{RatchetError, Result};
use crate::record::Payload;

/// Recognized mapping keys.
pub const HISTORY_CAPACITY_PER_ENGINE: &str = "history_capacity_per_engine";
pub const ACTION_TIMEOUT: &str = "action_timeout";
pub const MINIMUM_FAILURE_COOLDOWN: &str = "minimum_failure_cooldown";
pub const FAILURE_WINDOW_SIZE: &str = "failure_window_size";
pub const FAILURE_THRESHOLD: &str = "failure_threshold";
pub const GRACE_PERIOD_ON_STOP: &str = "grace_period_on_stop";
pub const DEFAULT_COMPOUNDING_FRACTION: &str = "default_compounding_fraction";
pub const TICK_INTERVAL: &str = "tick_interval";
pub const INTERNAL_ERROR_CAPACITY: &str = "internal_error_capacity";

/// Prefix for environment variables read by [`OrchestratorConfig::from_env`].
const ENV_PREFIX: &str = "RATCHET_";

/// Configuration for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    /// Records retained per engine before FIFO eviction.
    pub history_capacity_per_engine: usize,
    /// Upper bound on a single action invocation.
    pub action_timeout: Duration,
    /// Floor for the cooldown applied after repeated failures.
    pub minimum_failure_cooldown: Duration,
    /// Number of recent attempts inspected for the failure threshold.
    pub failure_window_size: usize,
    /// Errors within the window that activate the cooldown.
    pub failure_threshold: usize,
    /// How long `stop()` waits for in-flight invocations.
    pub grace_period_on_stop: Duration,
    /// Pre-action cadence as a fraction of the main cadence.
    pub default_compounding_fraction: f64,
    /// How often the background driver ticks.
    pub tick_interval: Duration,
    /// Internal errors (sink failures) kept for status reports.
    pub internal_error_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_capacity_per_engine: 1000,
            action_timeout: Duration::from_secs(30),
            minimum_failure_cooldown: Duration::from_secs(5),
            failure_window_size: 10,
            failure_threshold: 3,
            grace_period_on_stop: Duration::from_secs(10),
            default_compounding_fraction: 0.25,
            tick_interval: Duration::from_millis(50),
            internal_error_capacity: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity_per_engine = capacity;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_minimum_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.minimum_failure_cooldown = cooldown;
        self
    }

    pub fn with_failure_window(mut self, window_size: usize, threshold: usize) -> Self {
        self.failure_window_size = window_size;
        self.failure_threshold = threshold;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_on_stop = grace;
        self
    }

    pub fn with_compounding_fraction(mut self, fraction: f64) -> Self {
        self.default_compounding_fraction = fraction;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    /// Build a configuration from a mapping, starting from the defaults.
    ///
    /// Unknown keys are logged and ignored. The result is validated.
    pub fn from_map(map: &Payload) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in map {
            config.apply(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `RATCHET_*` environment variables.
    ///
    /// Loads `.env` if present (development). Variables are named after the
    /// mapping keys, upper-cased: `RATCHET_ACTION_TIMEOUT=45s`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mut config = Self::default();
        for key in [
            HISTORY_CAPACITY_PER_ENGINE,
            ACTION_TIMEOUT,
            MINIMUM_FAILURE_COOLDOWN,
            FAILURE_WINDOW_SIZE,
            FAILURE_THRESHOLD,
            GRACE_PERIOD_ON_STOP,
            DEFAULT_COMPOUNDING_FRACTION,
            TICK_INTERVAL,
            INTERNAL_ERROR_CAPACITY,
        ] {
            let var = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Ok(raw) = env::var(&var) {
                config.apply(key, &Value::String(raw))?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            HISTORY_CAPACITY_PER_ENGINE => {
                self.history_capacity_per_engine = parse_count(key, value)?
            }
            ACTION_TIMEOUT => self.action_timeout = parse_duration(key, value)?,
            MINIMUM_FAILURE_COOLDOWN => self.minimum_failure_cooldown = parse_duration(key, value)?,
            FAILURE_WINDOW_SIZE => self.failure_window_size = parse_count(key, value)?,
            FAILURE_THRESHOLD => self.failure_threshold = parse_count(key, value)?,
            GRACE_PERIOD_ON_STOP => self.grace_period_on_stop = parse_duration(key, value)?,
            DEFAULT_COMPOUNDING_FRACTION => {
                self.default_compounding_fraction = parse_fraction(key, value)?
            }
            TICK_INTERVAL => self.tick_interval = parse_duration(key, value)?,
            INTERNAL_ERROR_CAPACITY => self.internal_error_capacity = parse_count(key, value)?,
            unknown => warn!(key = unknown, "ignoring unrecognized configuration key"),
        }
        Ok(())
    }

    /// Check every value against its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity_per_engine == 0 {
            return Err(invalid(HISTORY_CAPACITY_PER_ENGINE, "must be positive"));
        }
        if self.action_timeout.is_zero() {
            return Err(invalid(ACTION_TIMEOUT, "must be positive"));
        }
        if self.failure_window_size == 0 {
            return Err(invalid(FAILURE_WINDOW_SIZE, "must be positive"));
        }
        if self.failure_threshold == 0 || self.failure_threshold > self.failure_window_size {
            return Err(invalid(
                FAILURE_THRESHOLD,
                "must be between 1 and failure_window_size",
            ));
        }
        if !(self.default_compounding_fraction > 0.0 && self.default_compounding_fraction < 1.0) {
            return Err(invalid(
                DEFAULT_COMPOUNDING_FRACTION,
                "must be strictly between 0 and 1",
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid(TICK_INTERVAL, "must be positive"));
        }
        Ok(())
    }

    /// Cooldown applied to an action with main cadence `interval`.
    pub fn failure_cooldown(&self, interval: Duration) -> Duration {
        (interval / 10).max(self.minimum_failure_cooldown)
    }
}

fn invalid(key: &str, reason: &str) -> RatchetError {
    RatchetError::Config(format!("{key} {reason}"))
}

fn parse_count(key: &str, value: &Value) -> Result<usize> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(key, "must be a non-negative integer"))
}

fn parse_fraction(key: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(key, "must be a number"))
}

fn parse_duration(key: &str, value: &Value) -> Result<Duration> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| invalid(key, "must be a non-negative number of milliseconds")),
        Value::String(s) => parse_duration_str(s).ok_or_else(|| {
            invalid(key, "must be milliseconds or a number with ms/s/m/h suffix")
        }),
        _ => Err(invalid(key, "must be a duration")),
    }
}

/// Parse `250`, `250ms`, `30s`, `1.5s`, `5m` or `2h`.
fn parse_duration_str(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let seconds = match unit.trim() {
        "" | "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}
