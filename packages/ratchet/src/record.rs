//! Execution records: the only data shape ratchet publishes.
//!
//! One record is produced for every action invocation the orchestrator makes,
//! every invocation it refuses to make (overrun), and every invocation it
//! abandons on shutdown. Records are immutable once built.
//!
//! ```text
//! engine: string
//! action: string
//! started_at: timestamp
//! finished_at: timestamp
//! outcome: "ok" | "error" | "skipped"
//! cause: "scheduled" | "triggered:<context>" | "pre_for:<action>" | "shutdown" | "overrun"
//! payload: mapping from string to any
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::clock::Timestamp;

/// Opaque mapping produced by actions and attached to records.
pub type Payload = serde_json::Map<String, Value>;

/// Payload key carrying the reason for an `error` or `skipped` record.
pub const REASON_KEY: &str = "reason";

/// Build a payload holding only a `reason`.
pub(crate) fn reason_payload(reason: impl Into<String>) -> Payload {
    let mut payload = Payload::new();
    payload.insert(REASON_KEY.to_string(), Value::String(reason.into()));
    payload
}

// =============================================================================
// Outcome
// =============================================================================

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action returned a payload.
    Ok,
    /// The action failed, panicked, or timed out.
    Error,
    /// The invocation was never run (overrun) or was abandoned (shutdown).
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "ok"),
            Outcome::Error => write!(f, "error"),
            Outcome::Skipped => write!(f, "skipped"),
        }
    }
}

// =============================================================================
// Cause
// =============================================================================

/// Why an invocation happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The scheduler found the main action due.
    Scheduled,
    /// An explicit trigger for the named context.
    Triggered(String),
    /// The pre-action of the named compounding action.
    PreFor(String),
    /// The invocation was in flight when the orchestrator shut down.
    Shutdown,
    /// The invocation was due while the previous one was still running.
    Overrun,
}

impl Cause {
    /// Whether this invocation came from the cadence (and may move it).
    pub fn is_cadence(&self) -> bool {
        matches!(self, Cause::Scheduled | Cause::PreFor(_))
    }

    /// The trigger context, for triggered invocations.
    pub fn context(&self) -> Option<&str> {
        match self {
            Cause::Triggered(context) => Some(context),
            _ => None,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Scheduled => write!(f, "scheduled"),
            Cause::Triggered(context) => write!(f, "triggered:{context}"),
            Cause::PreFor(action) => write!(f, "pre_for:{action}"),
            Cause::Shutdown => write!(f, "shutdown"),
            Cause::Overrun => write!(f, "overrun"),
        }
    }
}

/// Error returned when a cause string does not match the published format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized cause: {0}")]
pub struct ParseCauseError(String);

impl FromStr for Cause {
    type Err = ParseCauseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Cause::Scheduled),
            "shutdown" => Ok(Cause::Shutdown),
            "overrun" => Ok(Cause::Overrun),
            other => {
                if let Some(context) = other.strip_prefix("triggered:") {
                    Ok(Cause::Triggered(context.to_string()))
                } else if let Some(action) = other.strip_prefix("pre_for:") {
                    Ok(Cause::PreFor(action.to_string()))
                } else {
                    Err(ParseCauseError(other.to_string()))
                }
            }
        }
    }
}

impl Serialize for Cause {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cause {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Execution Record
// =============================================================================

/// Immutable outcome of a single action invocation.
///
/// Invariants: `started_at <= finished_at`, and `payload` is an empty map
/// rather than absent when there is nothing to report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub engine: String,
    pub action: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub outcome: Outcome,
    pub cause: Cause,
    pub payload: Payload,
}

impl ExecutionRecord {
    /// Build a record, clamping `finished_at` so it never precedes `started_at`.
    pub fn new(
        engine: impl Into<String>,
        action: impl Into<String>,
        started_at: Timestamp,
        finished_at: Timestamp,
        outcome: Outcome,
        cause: Cause,
        payload: Payload,
    ) -> Self {
        Self {
            engine: engine.into(),
            action: action.into(),
            started_at,
            finished_at: finished_at.max(started_at),
            outcome,
            cause,
            payload,
        }
    }

    /// A zero-length `skipped` record carrying `reason`.
    pub(crate) fn skipped(
        engine: impl Into<String>,
        action: impl Into<String>,
        at: Timestamp,
        cause: Cause,
        reason: &str,
    ) -> Self {
        Self::new(
            engine,
            action,
            at,
            at,
            Outcome::Skipped,
            cause,
            reason_payload(reason),
        )
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }

    pub fn is_error(&self) -> bool {
        self.outcome == Outcome::Error
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == Outcome::Skipped
    }

    /// Whether this record describes a pre-action invocation.
    pub fn is_pre(&self) -> bool {
        matches!(self.cause, Cause::PreFor(_))
    }

    /// The `reason` entry of the payload, if present.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get(REASON_KEY).and_then(Value::as_str)
    }

    /// Wall time spent in the invocation.
    pub fn duration(&self) -> Duration {
        self.finished_at - self.started_at
    }
}
