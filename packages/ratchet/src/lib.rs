//! # Ratchet
//!
//! A recursive improvement orchestrator: pluggable engines run improvement
//! actions on compounding schedules, react to context triggers, and leave an
//! append-only execution history behind.
//!
//! ## Core Concepts
//!
//! - [`EngineDescriptor`] = a named unit of improvement logic with a
//!   lifecycle, a priority and the trigger contexts it handles
//! - [`CompoundingAction`] = a main action on a fixed cadence `I`, optionally
//!   preceded by a cheap pre-action on the faster cadence `round(I × f)`
//! - [`Trigger`] = an out-of-schedule request that runs the main actions of
//!   every engine handling its context, once
//! - [`ExecutionRecord`] = what happened, always recorded and never raised
//!
//! ## Architecture
//!
//! ```text
//! Clock ──► driver (start) / advance (manual)
//!              │
//!              ▼ tick(now)
//!          Scheduler ──► plan ──► pre ─► main      (cadence causes)
//!              │             └──► overrun records (still running)
//!              ▼
//!          HistoryStore ◄── triggers (caller's task, cadence untouched)
//!              │
//!              └─► HistorySink (optional, failures counted)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **History is append-only** - records are never mutated; the oldest are
//!    evicted past capacity
//! 2. **Nothing escapes** - errors, panics and timeouts in engine code become
//!    `error` records
//! 3. **Cadence is a floor** - two scheduled mains of one action start at
//!    least `I` apart; there are no catch-up bursts
//! 4. **Repeated failure cools down** - `failure_threshold` errors in the
//!    window pause scheduling for `max(I / 10, minimum_failure_cooldown)`
//! 5. **Triggers are isolated** - triggered runs never move cadence state
//! 6. **Deterministic under a controlled clock** - same inputs, same history
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ratchet::{
//!     action_fn, CompoundingAction, EngineDescriptor, ManualClock, Orchestrator,
//!     OrchestratorConfig, Payload, Trigger, FEEDBACK,
//! };
//!
//! let clock = ManualClock::new();
//! let orchestrator = Orchestrator::new(Arc::new(clock.clone()), OrchestratorConfig::default())?;
//!
//! orchestrator.register(
//!     EngineDescriptor::new("tuner")
//!         .handles(FEEDBACK)
//!         .with_action(
//!             CompoundingAction::new("tune", Duration::from_secs(60), action_fn(|_ctx| async {
//!                 Ok(Payload::new())
//!             }))
//!             .with_pre(action_fn(|_ctx| async { Ok(Payload::new()) })),
//!         ),
//! )?;
//!
//! orchestrator.start_manual()?;
//! clock.advance(Duration::from_secs(60));
//! orchestrator.advance().await?;
//!
//! orchestrator.trigger(Trigger::new(FEEDBACK)).await?;
//! println!("{:?}", orchestrator.history("tuner", 10)?);
//! ```

// Core modules
pub mod action;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod hook;
pub mod orchestrator;
pub mod record;
pub mod status;
pub mod trigger;
mod scheduler;

// Built-in engines
pub mod engines;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Scenario and invariant tests (test-only)
#[cfg(test)]
mod scenario_tests;

pub use action::{
    action_fn, Action, ActionContext, Cadence, CompoundingAction, FailureWindow, FnAction,
    LastRunPolicy, Which,
};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::OrchestratorConfig;
pub use engine::{EngineDescriptor, EngineHandle, EngineState};
pub use error::{RatchetError, Result};
pub use history::{Aggregate, HistorySink, HistoryStore, InternalError};
pub use hook::{Subsystem, SubsystemHook};
pub use orchestrator::{Orchestrator, OrchestratorState, StopOptions};
pub use record::{Cause, ExecutionRecord, Outcome, Payload, REASON_KEY};
pub use scheduler::{PlannedInvocation, TickReport};
pub use status::{ActionStatus, Backlog, EngineStatus, StatusSnapshot};
pub use trigger::{
    PayloadPredicate, Trigger, COORDINATION_OPTIMIZATION, FAILURE_PREVENTION, FEEDBACK, MANUAL,
    RESERVED_CONTEXTS, SELF_CONTEXT, SUBSCRIPTION_RESOLUTION, WILDCARD,
};

// Re-export async_trait for implementing Action, Subsystem and data sources
pub use async_trait::async_trait;
