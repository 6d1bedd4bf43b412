//! Testing utilities for orchestrator scenarios.
//!
//! # Feature Flag
//!
//! Outside this crate's own tests the module needs the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! ratchet = { path = "../ratchet", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use ratchet::testing::{drive, ScriptedAction, Step};
//!
//! let clock = ManualClock::new();
//! let action = ScriptedAction::new([Step::fail("boom"), Step::Ok]);
//! orchestrator.register(
//!     EngineDescriptor::new("e")
//!         .with_action(CompoundingAction::new("a", Duration::from_millis(100), action.clone())),
//! )?;
//! orchestrator.start_manual()?;
//!
//! drive(&orchestrator, &clock, Timestamp::from_millis(1000), Duration::from_millis(10)).await?;
//! assert_eq!(action.calls(), 10);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::action::{Action, ActionContext};
use crate::clock::{Clock, ManualClock, Timestamp};
use crate::history::HistorySink;
use crate::orchestrator::Orchestrator;
use crate::record::{ExecutionRecord, Payload};
use crate::scheduler::TickReport;

// =============================================================================
// Scripted Action
// =============================================================================

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Ok,
    Fail(String),
    Panic(String),
}

impl Step {
    pub fn fail(message: impl Into<String>) -> Self {
        Step::Fail(message.into())
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Step::Panic(message.into())
    }
}

struct Script {
    steps: Vec<Step>,
    calls: AtomicUsize,
}

/// An action that plays back a fixed sequence of outcomes, then keeps
/// succeeding.
///
/// Clones share the script and the call counter, so a test can keep one clone
/// and register the other.
#[derive(Clone)]
pub struct ScriptedAction {
    script: Arc<Script>,
}

impl ScriptedAction {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Script {
                steps: steps.into_iter().collect(),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn always_ok() -> Self {
        Self::new([])
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_first(n: usize) -> Self {
        Self::new((1..=n).map(|i| Step::fail(format!("scripted failure {i}"))))
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for ScriptedAction {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        let call = self.script.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.steps.get(call).cloned().unwrap_or(Step::Ok) {
            Step::Ok => {
                let mut payload = Payload::new();
                payload.insert("call".into(), (call + 1).into());
                Ok(payload)
            }
            Step::Fail(message) => bail!(message),
            Step::Panic(message) => panic!("{message}"),
        }
    }
}

// =============================================================================
// Sleepy Action
// =============================================================================

/// An action that sleeps on the injected clock before succeeding.
#[derive(Clone)]
pub struct SleepyAction {
    clock: Arc<dyn Clock>,
    duration: Duration,
    calls: Arc<AtomicUsize>,
}

impl SleepyAction {
    pub fn new(clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self {
            clock,
            duration,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for SleepyAction {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clock.sleep(self.duration).await;
        let mut payload = Payload::new();
        payload.insert(
            "slept_ms".into(),
            (self.duration.as_millis() as u64).into(),
        );
        Ok(payload)
    }
}

// =============================================================================
// Recording Sink
// =============================================================================

/// A history sink that keeps every record it is given, and can be told to
/// fail.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<ExecutionRecord>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `record` call fail (or succeed again).
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl HistorySink for RecordingSink {
    fn record(&self, record: &ExecutionRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("sink unavailable");
        }
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Driving
// =============================================================================

/// Tick `orchestrator` at the clock's current time, then every `step` up to
/// and including `until`.
pub async fn drive(
    orchestrator: &Orchestrator,
    clock: &ManualClock,
    until: Timestamp,
    step: Duration,
) -> crate::error::Result<Vec<TickReport>> {
    let mut reports = Vec::new();
    loop {
        reports.push(orchestrator.advance().await?);
        let now = clock.now();
        if now >= until {
            return Ok(reports);
        }
        clock.advance(step.min(until - now));
    }
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
