//! Compounding actions: the unit of work the scheduler dispatches.
//!
//! A [`CompoundingAction`] pairs a heavy `main` callable with an optional
//! lightweight `pre` callable that fires more often (every `f × I`, where `I`
//! is the main cadence). When both are due in the same tick the pre runs
//! first; a chained action then hands the pre's payload to the main.
//!
//! ```text
//!   0        25        50        75       100       125 ...   (I = 100, f = 0.25)
//!   │ pre ───┼─ pre ───┼─ pre ───┼─ pre ──┤
//!   │                                     ├─► main (sees last pre output)
//! ```
//!
//! # Key Properties
//!
//! - **Cadence is a floor**: `due_main(now)` is `now − last_main_at ≥ I`.
//! - **Success moves cadence**: `last_*_at` only changes on `ok`.
//! - **Failures cool down**: after `failure_threshold` errors in the last
//!   `failure_window_size` attempts, the callable waits
//!   `max(I / 10, minimum_failure_cooldown)` before its next attempt.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ratchet::{action_fn, CompoundingAction, Payload};
//!
//! let retrain = CompoundingAction::new(
//!     "retrain",
//!     Duration::from_secs(3600),
//!     action_fn(|ctx| async move {
//!         let samples = ctx.pre_output().cloned().unwrap_or_default();
//!         Ok(samples)
//!     }),
//! )
//! .with_pre(action_fn(|_ctx| async move { Ok(Payload::new()) }))
//! .chained();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, Timestamp};
use crate::engine::EngineHandle;
use crate::record::{reason_payload, Cause, Outcome, Payload};

// =============================================================================
// Action Trait
// =============================================================================

/// A fallible callable producing a payload.
///
/// Errors and panics never escape: the orchestrator turns them into `error`
/// records with a `reason` in the payload.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn run(&self, ctx: ActionContext) -> Result<Payload>;
}

/// An [`Action`] backed by an async closure.
pub struct FnAction<F> {
    f: F,
}

/// Wrap an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    FnAction { f }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    async fn run(&self, ctx: ActionContext) -> Result<Payload> {
        (self.f)(ctx).await
    }
}

// =============================================================================
// Action Context
// =============================================================================

/// Which callable of a compounding action is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Which {
    Pre,
    Main,
}

impl fmt::Display for Which {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Which::Pre => write!(f, "pre"),
            Which::Main => write!(f, "main"),
        }
    }
}

/// Everything an action invocation may look at.
///
/// Immutable and cheap to clone. The only way back into the orchestrator is
/// the [`EngineHandle`].
#[derive(Clone)]
pub struct ActionContext {
    engine: String,
    action: String,
    which: Which,
    cause: Cause,
    trigger_payload: Payload,
    pre_output: Option<Payload>,
    handle: EngineHandle,
}

impl ActionContext {
    pub(crate) fn new(
        action: &str,
        which: Which,
        cause: Cause,
        trigger_payload: Payload,
        pre_output: Option<Payload>,
        handle: EngineHandle,
    ) -> Self {
        Self {
            engine: handle.engine().to_string(),
            action: action.to_string(),
            which,
            cause,
            trigger_payload,
            pre_output,
            handle,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn which(&self) -> Which {
        self.which
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    /// Payload supplied with the trigger; empty for scheduled invocations.
    pub fn trigger_payload(&self) -> &Payload {
        &self.trigger_payload
    }

    /// Latest successful pre output, for chained main invocations.
    pub fn pre_output(&self) -> Option<&Payload> {
        self.pre_output.as_ref()
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Current time on the orchestrator's clock.
    pub fn now(&self) -> Timestamp {
        self.handle.now()
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("engine", &self.engine)
            .field("action", &self.action)
            .field("which", &self.which)
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Compounding Action
// =============================================================================

/// When `last_*_at` moves.
///
/// Only [`LastRunPolicy::OnSuccess`] is accepted at registration; an engine
/// asking for [`LastRunPolicy::Always`] is rejected with `BadDescriptor`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunPolicy {
    #[default]
    OnSuccess,
    Always,
}

/// A `{main, pre?}` pair with its cadence configuration.
#[derive(Clone)]
pub struct CompoundingAction {
    pub(crate) name: String,
    pub(crate) main: Arc<dyn Action>,
    pub(crate) main_interval: Duration,
    pub(crate) pre: Option<Arc<dyn Action>>,
    pub(crate) pre_fraction: Option<f64>,
    pub(crate) chained: bool,
    pub(crate) last_run_policy: LastRunPolicy,
}

impl CompoundingAction {
    pub fn new(name: impl Into<String>, main_interval: Duration, main: impl Action) -> Self {
        Self {
            name: name.into(),
            main: Arc::new(main),
            main_interval,
            pre: None,
            pre_fraction: None,
            chained: false,
            last_run_policy: LastRunPolicy::OnSuccess,
        }
    }

    /// Attach a pre-action running at `default_compounding_fraction × I`
    /// unless [`with_pre_fraction`](Self::with_pre_fraction) overrides it.
    pub fn with_pre(mut self, pre: impl Action) -> Self {
        self.pre = Some(Arc::new(pre));
        self
    }

    pub fn with_pre_fraction(mut self, fraction: f64) -> Self {
        self.pre_fraction = Some(fraction);
        self
    }

    /// Hand the latest successful pre output to the main.
    pub fn chained(mut self) -> Self {
        self.chained = true;
        self
    }

    pub fn with_last_run_policy(mut self, policy: LastRunPolicy) -> Self {
        self.last_run_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_interval(&self) -> Duration {
        self.main_interval
    }

    pub fn has_pre(&self) -> bool {
        self.pre.is_some()
    }

    pub fn is_chained(&self) -> bool {
        self.chained
    }

    /// Check the action against the registration rules, resolving the pre
    /// cadence with `default_fraction`. Returns the pre interval.
    pub(crate) fn validate(
        &self,
        default_fraction: f64,
    ) -> std::result::Result<Option<Duration>, String> {
        if self.name.trim().is_empty() {
            return Err("action name must not be empty".into());
        }
        if self.main_interval.is_zero() {
            return Err(format!("action '{}' has a zero main interval", self.name));
        }
        if self.last_run_policy != LastRunPolicy::OnSuccess {
            return Err(format!(
                "action '{}' asks to move its last run on error; only on-success is supported",
                self.name
            ));
        }
        if self.pre.is_none() {
            if self.pre_fraction.is_some() {
                return Err(format!("action '{}' sets a pre fraction without a pre", self.name));
            }
            return Ok(None);
        }

        let fraction = self.pre_fraction.unwrap_or(default_fraction);
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(format!(
                "action '{}' pre fraction {fraction} is outside (0, 1)",
                self.name
            ));
        }
        let nanos = (self.main_interval.as_nanos() as f64 * fraction).round();
        if nanos < 1.0 {
            return Err(format!("action '{}' pre interval rounds to zero", self.name));
        }
        Ok(Some(Duration::from_nanos(nanos as u64)))
    }
}

impl fmt::Debug for CompoundingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompoundingAction")
            .field("name", &self.name)
            .field("main_interval", &self.main_interval)
            .field("has_pre", &self.pre.is_some())
            .field("pre_fraction", &self.pre_fraction)
            .field("chained", &self.chained)
            .finish()
    }
}

// =============================================================================
// Failure Window
// =============================================================================

/// The outcomes of the most recent attempts of one callable.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    size: usize,
    attempts: VecDeque<bool>,
}

impl FailureWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            attempts: VecDeque::with_capacity(size.max(1)),
        }
    }

    /// Record an attempt; `failed` is true for errors.
    pub fn push(&mut self, failed: bool) {
        if self.attempts.len() == self.size {
            self.attempts.pop_front();
        }
        self.attempts.push_back(failed);
    }

    /// Errors among the retained attempts.
    pub fn errors(&self) -> usize {
        self.attempts.iter().filter(|failed| **failed).count()
    }
}

// =============================================================================
// Cadence
// =============================================================================

/// Scheduling state of one compounding action.
///
/// A cadence is unarmed until the scheduler first observes its engine
/// running; arming anchors `last_main_at` and `last_pre_at` to that instant,
/// so the first main fires one interval later.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    pre_interval: Option<Duration>,
    last_main_at: Option<Timestamp>,
    last_pre_at: Option<Timestamp>,
    main_failures: FailureWindow,
    pre_failures: FailureWindow,
    main_cooldown_until: Option<Timestamp>,
    pre_cooldown_until: Option<Timestamp>,
    running_since: Option<Timestamp>,
    last_overrun_at: Option<Timestamp>,
    pre_output: Option<Payload>,
}

/// What recording an attempt did to the cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceChange {
    /// Nothing beyond bookkeeping.
    None,
    /// `last_*_at` moved forward.
    Advanced,
    /// The failure threshold was reached; the callable cools down until the
    /// given instant.
    CooldownUntil(Timestamp),
}

impl Cadence {
    pub fn new(interval: Duration, pre_interval: Option<Duration>, window_size: usize) -> Self {
        Self {
            interval,
            pre_interval,
            last_main_at: None,
            last_pre_at: None,
            main_failures: FailureWindow::new(window_size),
            pre_failures: FailureWindow::new(window_size),
            main_cooldown_until: None,
            pre_cooldown_until: None,
            running_since: None,
            last_overrun_at: None,
            pre_output: None,
        }
    }

    pub fn arm(&mut self, now: Timestamp) {
        if self.last_main_at.is_none() {
            self.last_main_at = Some(now);
            if self.pre_interval.is_some() {
                self.last_pre_at = Some(now);
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.last_main_at.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pre_interval(&self) -> Option<Duration> {
        self.pre_interval
    }

    pub fn last_main_at(&self) -> Option<Timestamp> {
        self.last_main_at
    }

    pub fn last_pre_at(&self) -> Option<Timestamp> {
        self.last_pre_at
    }

    pub fn cooldown_until(&self, which: Which) -> Option<Timestamp> {
        match which {
            Which::Main => self.main_cooldown_until,
            Which::Pre => self.pre_cooldown_until,
        }
    }

    pub fn running_since(&self) -> Option<Timestamp> {
        self.running_since
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub(crate) fn pre_output(&self) -> Option<&Payload> {
        self.pre_output.as_ref()
    }

    fn cooling(&self, which: Which, now: Timestamp) -> bool {
        self.cooldown_until(which).is_some_and(|until| now < until)
    }

    /// `now − last_main_at ≥ I`, outside any cooldown.
    pub fn due_main(&self, now: Timestamp) -> bool {
        match self.last_main_at {
            Some(last) => !self.cooling(Which::Main, now) && now - last >= self.interval,
            None => false,
        }
    }

    /// The pre exists and `now − last_pre_at ≥ f × I`, outside any cooldown.
    pub fn due_pre(&self, now: Timestamp) -> bool {
        match (self.pre_interval, self.last_pre_at) {
            (Some(pre_interval), Some(last)) => {
                !self.cooling(Which::Pre, now) && now - last >= pre_interval
            }
            _ => false,
        }
    }

    /// Whether a running action has been due for a whole interval since it
    /// started (or since its last overrun record), so an overrun is recorded.
    pub fn overrun_due(&self, now: Timestamp) -> bool {
        let Some(running_since) = self.running_since else {
            return false;
        };
        if self.cooling(Which::Main, now) {
            return false;
        }
        let reference = [self.last_main_at, Some(running_since), self.last_overrun_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(running_since);
        now - reference >= self.interval
    }

    /// The pre slot `now` falls in, counted from the last main run.
    ///
    /// Pres stay phase-locked to the main cycle, so slow ticks never push
    /// the pre out of step with the main.
    pub fn pre_slot(&self, now: Timestamp) -> Timestamp {
        let (Some(pre_interval), Some(anchor)) = (self.pre_interval, self.last_main_at) else {
            return now;
        };
        if now <= anchor {
            return now;
        }
        let slots = (now - anchor).as_nanos() / pre_interval.as_nanos().max(1);
        let offset = pre_interval.as_nanos().saturating_mul(slots);
        anchor + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }

    pub(crate) fn mark_running(&mut self, since: Timestamp) {
        self.running_since = Some(since);
    }

    pub(crate) fn mark_idle(&mut self) {
        self.running_since = None;
    }

    pub(crate) fn mark_overrun(&mut self, at: Timestamp) {
        self.last_overrun_at = Some(at);
    }

    /// Apply a finished cadence attempt.
    ///
    /// `cooldown` is the gap applied once the failure threshold is reached.
    pub(crate) fn record(
        &mut self,
        which: Which,
        outcome: Outcome,
        started_at: Timestamp,
        finished_at: Timestamp,
        payload: &Payload,
        threshold: usize,
        cooldown: Duration,
    ) -> CadenceChange {
        match outcome {
            Outcome::Ok => {
                match which {
                    Which::Main => {
                        self.last_main_at = Some(started_at);
                        self.main_failures.push(false);
                        self.main_cooldown_until = None;
                    }
                    Which::Pre => {
                        self.last_pre_at = Some(self.pre_slot(started_at));
                        self.pre_failures.push(false);
                        self.pre_cooldown_until = None;
                        self.pre_output = Some(payload.clone());
                    }
                }
                CadenceChange::Advanced
            }
            Outcome::Error => {
                let (window, cooldown_until) = match which {
                    Which::Main => (&mut self.main_failures, &mut self.main_cooldown_until),
                    Which::Pre => (&mut self.pre_failures, &mut self.pre_cooldown_until),
                };
                window.push(true);
                if window.errors() >= threshold {
                    let until = finished_at + cooldown;
                    *cooldown_until = Some(until);
                    CadenceChange::CooldownUntil(until)
                } else {
                    CadenceChange::None
                }
            }
            Outcome::Skipped => CadenceChange::None,
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// The result of running one callable.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub outcome: Outcome,
    pub payload: Payload,
}

/// Run `action` once, bounded by `timeout` on `clock`.
///
/// Errors become `reason = <message>`, panics `reason = "panic"`, and an
/// exceeded budget `reason = "timeout"`. The returned future owns everything
/// it touches, so the driver can keep it in flight across ticks.
pub(crate) fn invoke(
    action: Arc<dyn Action>,
    ctx: ActionContext,
    clock: Arc<dyn Clock>,
    timeout: Duration,
) -> BoxFuture<'static, Invocation> {
    async move {
        let started_at = clock.now();
        let run = AssertUnwindSafe(action.run(ctx)).catch_unwind();

        let result = tokio::select! {
            biased;
            result = run => Some(result),
            _ = clock.sleep(timeout) => None,
        };
        let finished_at = clock.now();

        let (outcome, payload) = match result {
            Some(Ok(Ok(payload))) => (Outcome::Ok, payload),
            Some(Ok(Err(err))) => (Outcome::Error, reason_payload(format!("{err:#}"))),
            Some(Err(panic_info)) => {
                let mut payload = reason_payload("panic");
                payload.insert(
                    "panic".to_string(),
                    Value::String(extract_panic_message(&panic_info)),
                );
                (Outcome::Error, payload)
            }
            None => (Outcome::Error, reason_payload("timeout")),
        };

        Invocation {
            started_at,
            finished_at,
            outcome,
            payload,
        }
    }
    .boxed()
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
