//! Engines: named units owning compounding actions.
//!
//! An [`EngineDescriptor`] describes an engine before it is registered: its
//! actions, the trigger contexts it handles, its priority and metadata. Once
//! registered the orchestrator owns it and hands back an [`EngineHandle`],
//! the engine's only capability into the orchestrator.
//!
//! # Lifecycle
//!
//! ```text
//! created ──initialize()──► initialized ──start()──► running ──stop()──► stopped ──dispose()──► disposed
//!    │                          │                                                                  ▲
//!    └──────────────────────────┴──────────────────────dispose()───────────────────────────────────┘
//! ```
//!
//! Every other transition fails with `InvalidTransition` and leaves the state
//! unchanged. A failed `initialize()` keeps the engine `created`.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ratchet::{action_fn, CompoundingAction, EngineDescriptor, Payload, FAILURE_PREVENTION};
//!
//! let descriptor = EngineDescriptor::new("watchdog")
//!     .with_priority(10)
//!     .handles(FAILURE_PREVENTION)
//!     .with_action(CompoundingAction::new(
//!         "scan",
//!         Duration::from_secs(60),
//!         action_fn(|_ctx| async move { Ok(Payload::new()) }),
//!     ));
//!
//! let handle = orchestrator.register(descriptor)?;
//! handle.trigger_self();
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::action::CompoundingAction;
use crate::clock::{Clock, Timestamp};
use crate::error::{RatchetError, Result};
use crate::history::HistoryStore;
use crate::record::{ExecutionRecord, Payload};
use crate::trigger::{PayloadPredicate, WILDCARD};

// =============================================================================
// Engine State
// =============================================================================

/// Lifecycle state of an engine. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

impl EngineState {
    /// Whether `self → to` is a permitted transition.
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Created, Initialized)
                | (Initialized, Running)
                | (Running, Stopped)
                | (Stopped, Disposed)
                | (Created, Disposed)
                | (Initialized, Disposed)
        )
    }

    /// Engines in these states answer triggers.
    pub fn accepts_triggers(self) -> bool {
        matches!(self, EngineState::Initialized | EngineState::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Engine Descriptor
// =============================================================================

type Initializer = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Everything the orchestrator needs to know about an engine.
pub struct EngineDescriptor {
    pub(crate) name: String,
    pub(crate) state: EngineState,
    pub(crate) enabled: bool,
    pub(crate) priority: i32,
    pub(crate) actions: Vec<CompoundingAction>,
    pub(crate) metadata: Payload,
    pub(crate) contexts: Vec<String>,
    pub(crate) predicate: Option<PayloadPredicate>,
    initializer: Option<Initializer>,
}

impl EngineDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: EngineState::Created,
            enabled: true,
            priority: 0,
            actions: Vec::new(),
            metadata: Payload::new(),
            contexts: Vec::new(),
            predicate: None,
            initializer: None,
        }
    }

    pub fn with_action(mut self, action: CompoundingAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Lower values run first within a tick and within a trigger.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Declare a trigger context this engine handles.
    pub fn handles(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        if !self.contexts.contains(&context) {
            self.contexts.push(context);
        }
        self
    }

    /// Handle every trigger context.
    pub fn handles_any(self) -> Self {
        self.handles(WILDCARD)
    }

    /// Only answer triggers whose payload satisfies `predicate`.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Run `initializer` on the `created → initialized` transition.
    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Register the engine disabled; the scheduler skips it until enabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn actions(&self) -> &[CompoundingAction] {
        &self.actions
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    /// Move to `to`, failing with `InvalidTransition` (state unchanged) when
    /// the lifecycle forbids it.
    pub fn transition(&mut self, to: EngineState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(RatchetError::InvalidTransition {
                engine: self.name.clone(),
                from: self.state,
                to,
            });
        }
        debug!(engine = %self.name, from = %self.state, %to, "engine transition");
        self.state = to;
        Ok(())
    }

    /// Run the initializer and move `created → initialized`.
    ///
    /// On failure the engine stays `created` and may be initialized again.
    pub fn initialize(&mut self) -> Result<()> {
        if !self.state.can_transition_to(EngineState::Initialized) {
            return Err(RatchetError::InvalidTransition {
                engine: self.name.clone(),
                from: self.state,
                to: EngineState::Initialized,
            });
        }
        if let Some(initializer) = &self.initializer {
            initializer().map_err(|e| RatchetError::InitializationFailed {
                engine: self.name.clone(),
                reason: format!("{e:#}"),
            })?;
        }
        self.transition(EngineState::Initialized)
    }

    /// Check the descriptor and resolve each action's pre interval.
    pub(crate) fn validate(&self, default_fraction: f64) -> Result<Vec<Option<Duration>>> {
        if self.name.trim().is_empty() {
            return Err(RatchetError::bad_descriptor(&self.name, "engine name must not be empty"));
        }
        if self.actions.is_empty() {
            return Err(RatchetError::bad_descriptor(&self.name, "engine has no actions"));
        }
        if self.contexts.iter().any(|c| c.trim().is_empty()) {
            return Err(RatchetError::bad_descriptor(&self.name, "empty trigger context"));
        }

        let mut seen = HashSet::new();
        let mut pre_intervals = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            if !seen.insert(action.name()) {
                return Err(RatchetError::bad_descriptor(
                    &self.name,
                    format!("duplicate action name '{}'", action.name()),
                ));
            }
            let pre_interval = action
                .validate(default_fraction)
                .map_err(|reason| RatchetError::bad_descriptor(&self.name, reason))?;
            pre_intervals.push(pre_interval);
        }
        Ok(pre_intervals)
    }
}

impl fmt::Debug for EngineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDescriptor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("actions", &self.actions)
            .field("contexts", &self.contexts)
            .field("has_predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Self Triggers
// =============================================================================

/// Engines that asked for an out-of-cadence pass, in request order.
#[derive(Debug, Default)]
pub struct SelfTriggerQueue {
    pending: Mutex<Vec<String>>,
}

impl SelfTriggerQueue {
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `engine`; repeated requests before the next tick collapse.
    pub fn request(&self, engine: &str) {
        let mut pending = self.lock();
        if !pending.iter().any(|queued| queued == engine) {
            pending.push(engine.to_string());
        }
    }

    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// The capability an engine holds into the orchestrator.
///
/// Deliberately narrow: read the clock, ask for an extra pass, append a
/// record. It holds no reference to the orchestrator itself.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<str>,
    clock: Arc<dyn Clock>,
    history: Arc<HistoryStore>,
    self_triggers: Arc<SelfTriggerQueue>,
}

impl EngineHandle {
    pub(crate) fn new(
        engine: &str,
        clock: Arc<dyn Clock>,
        history: Arc<HistoryStore>,
        self_triggers: Arc<SelfTriggerQueue>,
    ) -> Self {
        Self {
            engine: Arc::from(engine),
            clock,
            history,
            self_triggers,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Run every main action of this engine once on the next tick, with
    /// cause `triggered:self`. Cadence state is not touched.
    pub fn trigger_self(&self) {
        debug!(engine = %self.engine, "self-trigger requested");
        self.self_triggers.request(&self.engine);
    }

    /// Append a record produced outside a regular invocation.
    pub fn log(&self, record: ExecutionRecord) -> Result<()> {
        if record.engine != *self.engine {
            return Err(RatchetError::BadRecord {
                engine: self.engine.to_string(),
                reason: format!("record belongs to engine '{}'", record.engine),
            });
        }
        if record.started_at > record.finished_at {
            return Err(RatchetError::BadRecord {
                engine: self.engine.to_string(),
                reason: "record finishes before it starts".into(),
            });
        }
        self.history.append(record);
        Ok(())
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
