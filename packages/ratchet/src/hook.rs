//! Subsystem hooks: admit an external subsystem as a single engine.
//!
//! A subsystem supplies two callbacks:
//!
//! - `current_state()` – a snapshot of itself, run as the pre-action
//! - `improve(state)` – one improvement pass over that snapshot, run as the
//!   chained main action
//!
//! It may also declare strategy labels. The orchestrator never chooses
//! between them; when an improvement outcome names a `strategy`, the record
//! notes whether it was one of the declared labels.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ratchet::{async_trait, Payload, Subsystem, SubsystemHook, MANUAL};
//!
//! struct DagManager;
//!
//! #[async_trait]
//! impl Subsystem for DagManager {
//!     async fn current_state(&self) -> anyhow::Result<Payload> { Ok(Payload::new()) }
//!     async fn improve(&self, state: Payload) -> anyhow::Result<Payload> { Ok(state) }
//! }
//!
//! let hook = SubsystemHook::new("dag_management", Duration::from_secs(600), DagManager)
//!     .with_strategies(["prune", "reorder"])
//!     .handles(MANUAL);
//! orchestrator.register_subsystem(hook)?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::action::{Action, ActionContext, CompoundingAction};
use crate::engine::EngineDescriptor;
use crate::record::Payload;

/// Name of the single action a hooked subsystem owns.
pub const HOOK_ACTION: &str = "improve";

/// Payload key an improvement outcome uses to name the strategy it applied.
pub const STRATEGY_KEY: &str = "strategy";

/// Payload key the orchestrator adds when the outcome names a strategy.
pub const STRATEGY_RECOGNIZED_KEY: &str = "strategy_recognized";

/// An external subsystem improved by the orchestrator.
#[async_trait]
pub trait Subsystem: Send + Sync + 'static {
    /// Snapshot of the subsystem's current state.
    async fn current_state(&self) -> Result<Payload>;

    /// Run one improvement pass over `state`, returning the outcome.
    async fn improve(&self, state: Payload) -> Result<Payload>;
}

/// Registration of a [`Subsystem`] as an engine.
pub struct SubsystemHook {
    name: String,
    subsystem: Arc<dyn Subsystem>,
    main_interval: Duration,
    pre_fraction: Option<f64>,
    strategies: Vec<String>,
    contexts: Vec<String>,
    priority: i32,
}

impl SubsystemHook {
    pub fn new(
        name: impl Into<String>,
        main_interval: Duration,
        subsystem: impl Subsystem,
    ) -> Self {
        Self {
            name: name.into(),
            subsystem: Arc::new(subsystem),
            main_interval,
            pre_fraction: None,
            strategies: Vec::new(),
            contexts: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_strategies<I, S>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strategies = strategies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pre_fraction(mut self, fraction: f64) -> Self {
        self.pre_fraction = Some(fraction);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn handles(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    /// Wrap the subsystem into an engine with one chained compounding action.
    pub fn into_descriptor(self) -> EngineDescriptor {
        let strategies = Arc::new(self.strategies);
        let mut action = CompoundingAction::new(
            HOOK_ACTION,
            self.main_interval,
            Improve {
                subsystem: self.subsystem.clone(),
                strategies: strategies.clone(),
            },
        )
        .with_pre(Snapshot {
            subsystem: self.subsystem,
        })
        .chained();
        if let Some(fraction) = self.pre_fraction {
            action = action.with_pre_fraction(fraction);
        }

        let mut descriptor = EngineDescriptor::new(self.name)
            .with_priority(self.priority)
            .with_metadata("kind", "subsystem_hook")
            .with_metadata(
                "strategies",
                Value::Array(strategies.iter().cloned().map(Value::String).collect()),
            )
            .with_action(action);
        for context in self.contexts {
            descriptor = descriptor.handles(context);
        }
        descriptor
    }
}

struct Snapshot {
    subsystem: Arc<dyn Subsystem>,
}

#[async_trait]
impl Action for Snapshot {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        self.subsystem.current_state().await
    }
}

struct Improve {
    subsystem: Arc<dyn Subsystem>,
    strategies: Arc<Vec<String>>,
}

#[async_trait]
impl Action for Improve {
    async fn run(&self, ctx: ActionContext) -> Result<Payload> {
        let mut state = match ctx.pre_output() {
            Some(state) => state.clone(),
            None => self.subsystem.current_state().await?,
        };
        if !ctx.trigger_payload().is_empty() {
            state.insert(
                "trigger".to_string(),
                Value::Object(ctx.trigger_payload().clone()),
            );
        }

        let mut outcome = self.subsystem.improve(state).await?;
        let strategy = outcome
            .get(STRATEGY_KEY)
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(strategy) = strategy {
            let recognized = self.strategies.iter().any(|known| *known == strategy);
            outcome.insert(STRATEGY_RECOGNIZED_KEY.to_string(), Value::Bool(recognized));
        }
        Ok(outcome)
    }
}
