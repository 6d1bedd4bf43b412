//! The orchestrator: registry, driver, triggers and status.
//!
//! The orchestrator owns every engine and a single scheduler. It is driven in
//! one of two ways:
//!
//! - [`Orchestrator::start`] spawns one background driver task that ticks the
//!   scheduler every `tick_interval` and whenever an in-flight invocation
//!   finishes.
//! - [`Orchestrator::start_manual`] activates the engines without a driver;
//!   the caller ticks with [`Orchestrator::advance`]. Combined with a
//!   [`ManualClock`](crate::ManualClock) this makes runs fully deterministic.
//!
//! # Shutdown
//!
//! ```text
//! stop(grace)
//!   ├─ stop dispatching
//!   ├─ drain in-flight invocations until they finish or grace expires
//!   ├─ leftovers ─► skipped / shutdown records
//!   └─ running engines ─► stopped
//! ```
//!
//! A hard stop (or a second `stop` with `hard` while a graceful stop drains)
//! abandons the remaining invocations right away.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ratchet::{Orchestrator, OrchestratorConfig, SystemClock, Trigger, MANUAL};
//!
//! let orchestrator =
//!     Orchestrator::new(Arc::new(SystemClock::new()), OrchestratorConfig::default())?;
//! orchestrator.register(descriptor)?;
//! orchestrator.start()?;
//!
//! let records = orchestrator.trigger(Trigger::new(MANUAL)).await?;
//!
//! orchestrator.stop().await?;
//! ```

use std::future::poll_fn;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::OrchestratorConfig;
use crate::engine::{EngineDescriptor, EngineHandle, EngineState, SelfTriggerQueue};
use crate::error::{RatchetError, Result};
use crate::history::{Aggregate, HistorySink, HistoryStore};
use crate::hook::SubsystemHook;
use crate::record::ExecutionRecord;
use crate::scheduler::{PlannedInvocation, Scheduler, TickReport, TriggerStart};
use crate::status::StatusSnapshot;
use crate::trigger::Trigger;

/// Lifecycle of the orchestrator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

/// How `stop_with` shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Drain budget; `None` uses `grace_period_on_stop`.
    pub grace: Option<Duration>,
    /// Abandon in-flight invocations without draining.
    pub hard: bool,
}

impl StopOptions {
    pub fn graceful(grace: Duration) -> Self {
        Self {
            grace: Some(grace),
            hard: false,
        }
    }

    pub fn hard() -> Self {
        Self {
            grace: None,
            hard: true,
        }
    }
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveMode {
    Background,
    Manual,
}

/// Shared between `stop_with` and the driver task.
#[derive(Clone)]
struct StopSignal {
    requested: CancellationToken,
    hard: CancellationToken,
    grace: Arc<Mutex<Duration>>,
}

impl StopSignal {
    fn new(grace: Duration) -> Self {
        Self {
            requested: CancellationToken::new(),
            hard: CancellationToken::new(),
            grace: Arc::new(Mutex::new(grace)),
        }
    }

    fn grace(&self) -> Duration {
        *self.grace.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_grace(&self, grace: Duration) {
        *self.grace.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = grace;
    }
}

struct Lifecycle {
    state: OrchestratorState,
    mode: Option<DriveMode>,
    driver: Option<JoinHandle<()>>,
    signal: Option<StopSignal>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    history: Arc<HistoryStore>,
    self_triggers: Arc<SelfTriggerQueue>,
    scheduler: Mutex<Scheduler>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One scheduler tick at the current clock reading.
    async fn tick(&self) -> TickReport {
        poll_fn(|cx| {
            let now = self.clock.now();
            Poll::Ready(self.scheduler().tick(now, cx))
        })
        .await
    }

    /// Ready once at least one in-flight invocation has finished.
    fn poll_progress(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.scheduler().poll_inflight(cx) > 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Poll in-flight invocations once and report how many remain.
    async fn remaining(&self) -> usize {
        poll_fn(|cx| {
            let mut scheduler = self.scheduler();
            scheduler.poll_inflight(cx);
            Poll::Ready(scheduler.in_flight())
        })
        .await
    }

    /// Wait for in-flight invocations within the grace period.
    async fn drain(&self, signal: &StopSignal) {
        let deadline = self.clock.now() + signal.grace();
        loop {
            let remaining = self.remaining().await;
            if remaining == 0 {
                debug!("in-flight invocations drained");
                return;
            }

            let now = self.clock.now();
            if signal.hard.is_cancelled() || now >= deadline {
                let abandoned = self.scheduler().abandon_inflight(now);
                warn!(
                    abandoned,
                    hard = signal.hard.is_cancelled(),
                    "abandoning in-flight invocations"
                );
                return;
            }

            tokio::select! {
                biased;
                _ = signal.hard.cancelled() => {}
                _ = poll_fn(|cx| self.poll_progress(cx)) => {}
                _ = self.clock.sleep(deadline - now) => {}
            }
        }
    }
}

/// The single driver loop.
async fn drive(inner: Arc<Inner>, signal: StopSignal) {
    let tick_interval = inner.config.tick_interval;
    info!(tick_ms = tick_interval.as_millis() as u64, "ratchet driver started");

    loop {
        let report = inner.tick().await;
        if report.dispatched > 0 || report.overruns > 0 {
            debug!(
                at = %report.at,
                dispatched = report.dispatched,
                completed = report.completed,
                overruns = report.overruns,
                in_flight = report.in_flight,
                "tick"
            );
        }

        tokio::select! {
            biased;
            _ = signal.requested.cancelled() => break,
            _ = poll_fn(|cx| inner.poll_progress(cx)) => {}
            _ = inner.clock.sleep(tick_interval) => {}
        }
    }

    inner.drain(&signal).await;
    inner.scheduler().stop_engines();
    info!("ratchet driver stopped");
}

/// Clears a triggered action's busy mark if the trigger is dropped midway.
struct BusyGuard<'a> {
    inner: &'a Inner,
    engine: usize,
    action: usize,
    armed: bool,
}

impl<'a> BusyGuard<'a> {
    fn new(inner: &'a Inner, engine: usize, action: usize) -> Self {
        Self {
            inner,
            engine,
            action,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.scheduler().release(self.engine, self.action);
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates engines on compounding schedules and records what they do.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator. The configuration is validated.
    pub fn new(clock: Arc<dyn Clock>, config: OrchestratorConfig) -> Result<Self> {
        Self::build(clock, config, None)
    }

    /// Create an orchestrator whose history also feeds `sink`.
    pub fn with_sink(
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        sink: Arc<dyn HistorySink>,
    ) -> Result<Self> {
        Self::build(clock, config, Some(sink))
    }

    fn build(
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        sink: Option<Arc<dyn HistorySink>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut history = HistoryStore::new(
            config.history_capacity_per_engine,
            config.internal_error_capacity,
        );
        if let Some(sink) = sink {
            history = history.with_sink(sink);
        }
        let history = Arc::new(history);
        let self_triggers = Arc::new(SelfTriggerQueue::default());
        let scheduler = Scheduler::new(
            clock.clone(),
            config.clone(),
            history.clone(),
            self_triggers.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                clock,
                config,
                history,
                self_triggers,
                scheduler: Mutex::new(scheduler),
                lifecycle: Mutex::new(Lifecycle {
                    state: OrchestratorState::Idle,
                    mode: None,
                    driver: None,
                    signal: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.lifecycle().state
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register an engine and hand back its capability.
    ///
    /// Nothing is mutated on error. An engine registered while the
    /// orchestrator runs is initialized and started right away.
    pub fn register(&self, descriptor: EngineDescriptor) -> Result<EngineHandle> {
        let lifecycle = self.inner.lifecycle();
        if lifecycle.state == OrchestratorState::Disposed {
            return Err(RatchetError::InvalidState(
                "orchestrator has been disposed".into(),
            ));
        }

        let mut scheduler = self.inner.scheduler();
        let handle = scheduler.register(descriptor)?;
        if lifecycle.state == OrchestratorState::Running {
            let index = scheduler.position(handle.engine())?;
            scheduler.start_engine(index);
        }
        Ok(handle)
    }

    /// Admit an external subsystem as a single engine.
    pub fn register_subsystem(&self, hook: SubsystemHook) -> Result<EngineHandle> {
        self.register(hook.into_descriptor())
    }

    /// Run an engine's initializer now rather than at `start()`.
    pub fn initialize_engine(&self, name: &str) -> Result<()> {
        let lifecycle = self.inner.lifecycle();
        let mut scheduler = self.inner.scheduler();
        let index = scheduler.position(name)?;
        scheduler.engines[index].descriptor.initialize()?;
        if lifecycle.state == OrchestratorState::Running {
            scheduler.start_engine(index);
        }
        Ok(())
    }

    /// Enable or disable an engine. Disabled engines are skipped by the
    /// scheduler and only answer forced triggers.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut scheduler = self.inner.scheduler();
        let index = scheduler.position(name)?;
        scheduler.engines[index].descriptor.enabled = enabled;
        info!(engine = %name, enabled, "engine enablement changed");
        Ok(())
    }

    pub fn set_priority(&self, name: &str, priority: i32) -> Result<()> {
        let mut scheduler = self.inner.scheduler();
        let index = scheduler.position(name)?;
        scheduler.set_priority(index, priority);
        Ok(())
    }

    /// Registered engine names in registration order.
    pub fn engine_names(&self) -> Vec<String> {
        self.inner.scheduler().engine_names()
    }

    pub fn engine_state(&self, name: &str) -> Result<EngineState> {
        let scheduler = self.inner.scheduler();
        let index = scheduler.position(name)?;
        Ok(scheduler.engines[index].descriptor.state())
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Start every engine and spawn the driver. Idempotent.
    ///
    /// Engines still `created` are initialized first; those whose initializer
    /// fails stay `created` and are not started.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle();
        match (lifecycle.state, lifecycle.mode) {
            (OrchestratorState::Running, Some(DriveMode::Background)) => return Ok(()),
            (OrchestratorState::Running, _) => {
                return Err(RatchetError::InvalidState(
                    "orchestrator is driven manually".into(),
                ))
            }
            (OrchestratorState::Idle, _) => {}
            (state, _) => {
                return Err(RatchetError::InvalidState(format!(
                    "cannot start an orchestrator that is {state:?}"
                )))
            }
        }
        let runtime = Handle::try_current().map_err(|_| {
            RatchetError::InvalidState("start() must be called inside a tokio runtime".into())
        })?;

        self.inner.scheduler().start_engines();
        let signal = StopSignal::new(self.inner.config.grace_period_on_stop);
        let driver = runtime.spawn(drive(self.inner.clone(), signal.clone()));

        lifecycle.state = OrchestratorState::Running;
        lifecycle.mode = Some(DriveMode::Background);
        lifecycle.driver = Some(driver);
        lifecycle.signal = Some(signal);
        info!(engines = self.inner.scheduler().engines.len(), "orchestrator started");
        Ok(())
    }

    /// Start every engine without a driver; tick with [`advance`](Self::advance).
    pub fn start_manual(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle();
        match (lifecycle.state, lifecycle.mode) {
            (OrchestratorState::Running, Some(DriveMode::Manual)) => return Ok(()),
            (OrchestratorState::Idle, _) => {}
            (state, _) => {
                return Err(RatchetError::InvalidState(format!(
                    "cannot start manual driving of an orchestrator that is {state:?}"
                )))
            }
        }

        self.inner.scheduler().start_engines();
        lifecycle.state = OrchestratorState::Running;
        lifecycle.mode = Some(DriveMode::Manual);
        info!("orchestrator started in manual mode");
        Ok(())
    }

    /// Run one tick at the clock's current reading.
    pub async fn advance(&self) -> Result<TickReport> {
        {
            let lifecycle = self.inner.lifecycle();
            match (lifecycle.state, lifecycle.mode) {
                (OrchestratorState::Running, Some(DriveMode::Manual)) => {}
                (OrchestratorState::Running, _) => {
                    return Err(RatchetError::InvalidState(
                        "orchestrator is driven by its background driver".into(),
                    ))
                }
                (state, _) => {
                    return Err(RatchetError::InvalidState(format!(
                        "cannot advance an orchestrator that is {state:?}"
                    )))
                }
            }
        }
        Ok(self.inner.tick().await)
    }

    /// The invocations due right now, without running them.
    pub fn plan(&self) -> Vec<PlannedInvocation> {
        let now = self.inner.clock.now();
        self.inner.scheduler().plan(now)
    }

    /// Graceful stop with the configured grace period.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(StopOptions::default()).await
    }

    /// Stop dispatching, drain or abandon in-flight invocations, and move
    /// running engines to `stopped`.
    pub async fn stop_with(&self, options: StopOptions) -> Result<()> {
        let grace = options.grace.unwrap_or(self.inner.config.grace_period_on_stop);

        let (mode, driver) = {
            let mut lifecycle = self.inner.lifecycle();
            match lifecycle.state {
                OrchestratorState::Running => {}
                OrchestratorState::Idle => {
                    self.inner.scheduler().stop_accepting();
                    lifecycle.state = OrchestratorState::Stopped;
                    info!("orchestrator stopped before it started");
                    return Ok(());
                }
                OrchestratorState::Stopping => {
                    if options.hard {
                        if let Some(signal) = &lifecycle.signal {
                            warn!("hard stop requested while draining");
                            signal.hard.cancel();
                        }
                    }
                    return Ok(());
                }
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::Disposed => {
                    return Err(RatchetError::InvalidState(
                        "orchestrator has been disposed".into(),
                    ))
                }
            }

            lifecycle.state = OrchestratorState::Stopping;
            self.inner.scheduler().stop_accepting();
            if let Some(signal) = &lifecycle.signal {
                signal.set_grace(grace);
                if options.hard {
                    signal.hard.cancel();
                }
                signal.requested.cancel();
            }
            (lifecycle.mode, lifecycle.driver.take())
        };

        info!(
            grace_ms = grace.as_millis() as u64,
            hard = options.hard,
            "stopping orchestrator"
        );

        match mode {
            Some(DriveMode::Background) => {
                if let Some(driver) = driver {
                    if let Err(e) = driver.await {
                        error!(error = %e, "driver task failed");
                        self.inner.scheduler().stop_engines();
                    }
                }
            }
            _ => {
                let remaining = self.inner.remaining().await;
                let mut scheduler = self.inner.scheduler();
                if remaining > 0 {
                    let now = self.inner.clock.now();
                    let abandoned = scheduler.abandon_inflight(now);
                    warn!(abandoned, "abandoning in-flight invocations");
                }
                scheduler.stop_engines();
            }
        }

        self.inner.lifecycle().state = OrchestratorState::Stopped;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Stop if needed, then dispose every engine. Registration fails
    /// afterwards.
    pub async fn dispose(&self) -> Result<()> {
        if self.state() == OrchestratorState::Disposed {
            return Ok(());
        }
        self.stop().await?;

        let mut lifecycle = self.inner.lifecycle();
        let mut scheduler = self.inner.scheduler();
        for entry in &mut scheduler.engines {
            let state = entry.descriptor.state();
            if state != EngineState::Disposed && state.can_transition_to(EngineState::Disposed) {
                entry.descriptor.transition(EngineState::Disposed)?;
            }
        }
        lifecycle.state = OrchestratorState::Disposed;
        info!("orchestrator disposed");
        Ok(())
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Run the main action of every engine routed for `trigger`, once, in the
    /// caller's task. Cadence state is never touched.
    ///
    /// Engines must be `initialized` or `running`, and enabled unless the
    /// trigger is forced.
    pub async fn trigger(&self, trigger: Trigger) -> Result<Vec<ExecutionRecord>> {
        if self.state() == OrchestratorState::Disposed {
            return Err(RatchetError::InvalidState(
                "orchestrator has been disposed".into(),
            ));
        }

        let targets: Vec<(usize, usize)> = {
            let scheduler = self.inner.scheduler();
            scheduler
                .route(&trigger.context, &trigger.payload)
                .iter()
                .filter_map(|name| scheduler.position(name).ok())
                .filter(|&index| {
                    let descriptor = &scheduler.engines[index].descriptor;
                    descriptor.state().accepts_triggers()
                        && (descriptor.is_enabled() || trigger.force)
                })
                .flat_map(|index| {
                    (0..scheduler.engines[index].cadences.len()).map(move |action| (index, action))
                })
                .collect()
        };
        info!(
            context = %trigger.context,
            force = trigger.force,
            invocations = targets.len(),
            "trigger"
        );

        let mut records = Vec::with_capacity(targets.len());
        for (engine, action) in targets {
            let start = self.inner.scheduler().start_trigger(
                engine,
                action,
                &trigger.context,
                &trigger.payload,
            );
            match start {
                TriggerStart::Skipped(record) => records.push(record),
                TriggerStart::Run(invocation) => {
                    let guard = BusyGuard::new(&self.inner, engine, action);
                    let invocation = invocation.await;
                    guard.disarm();
                    let record = self.inner.scheduler().finish_trigger(
                        engine,
                        action,
                        &trigger.context,
                        invocation,
                    );
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn status(&self) -> StatusSnapshot {
        let state = self.state();
        let now = self.inner.clock.now();
        let scheduler = self.inner.scheduler();
        StatusSnapshot::capture(state, now, &scheduler, self.inner.self_triggers.len())
    }

    /// The last `k` records of `engine`, oldest first.
    pub fn history(&self, engine: &str, k: usize) -> Result<Vec<ExecutionRecord>> {
        self.inner.scheduler().position(engine)?;
        Ok(self.inner.history.recent(engine, k))
    }

    /// Retained records of `engine` started at or after `since`.
    pub fn history_since(&self, engine: &str, since: Timestamp) -> Result<Vec<ExecutionRecord>> {
        self.inner.scheduler().position(engine)?;
        Ok(self.inner.history.since(engine, since))
    }

    pub fn aggregate(&self, engine: &str) -> Result<Aggregate> {
        self.inner.scheduler().position(engine)?;
        Ok(self.inner.history.aggregate(engine))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let lifecycle = self.inner.lifecycle();
        if let Some(signal) = &lifecycle.signal {
            signal.hard.cancel();
            signal.requested.cancel();
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("engines", &self.engine_names())
            .finish()
    }
}
