//! Status snapshots.
//!
//! A [`StatusSnapshot`] is a point-in-time copy of the orchestrator: engine
//! states, per-action cadence state, history aggregates and the scheduler
//! backlog. It only contains ordered collections, so under a controlled clock
//! two identical runs serialize to identical bytes.

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::action::Which;
use crate::clock::Timestamp;
use crate::engine::EngineState;
use crate::history::{Aggregate, InternalError};
use crate::orchestrator::OrchestratorState;
use crate::record::Payload;
use crate::scheduler::Scheduler;

fn as_micros<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

fn as_optional_micros<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => as_micros(duration, serializer),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    pub now: Timestamp,
    pub engines: Vec<EngineStatus>,
    pub backlog: Backlog,
    pub sink_failures: u64,
    pub internal_errors: Vec<InternalError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub state: EngineState,
    pub enabled: bool,
    pub priority: i32,
    pub contexts: Vec<String>,
    pub metadata: Payload,
    pub actions: Vec<ActionStatus>,
    pub history: Aggregate,
    /// Records currently retained.
    pub retained: usize,
    /// Errors among the last `failure_window_size` retained records.
    pub recent_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionStatus {
    pub name: String,
    #[serde(serialize_with = "as_micros")]
    pub interval: Duration,
    #[serde(serialize_with = "as_optional_micros")]
    pub pre_interval: Option<Duration>,
    pub chained: bool,
    pub last_main_at: Option<Timestamp>,
    pub last_pre_at: Option<Timestamp>,
    pub main_cooldown_until: Option<Timestamp>,
    pub pre_cooldown_until: Option<Timestamp>,
    pub running_since: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    pub in_flight: usize,
    pub queued_self_triggers: usize,
    /// Invocations that would be dispatched if the scheduler ticked now.
    pub due_now: usize,
}

impl StatusSnapshot {
    pub(crate) fn capture(
        state: OrchestratorState,
        now: Timestamp,
        scheduler: &Scheduler,
        queued_self_triggers: usize,
    ) -> Self {
        let history = &scheduler.history;
        let window = scheduler.config.failure_window_size;

        let engines = scheduler
            .engines
            .iter()
            .map(|entry| {
                let descriptor = &entry.descriptor;
                let actions = descriptor
                    .actions()
                    .iter()
                    .zip(&entry.cadences)
                    .map(|(action, cadence)| ActionStatus {
                        name: action.name().to_string(),
                        interval: cadence.interval(),
                        pre_interval: cadence.pre_interval(),
                        chained: action.is_chained(),
                        last_main_at: cadence.last_main_at(),
                        last_pre_at: cadence.last_pre_at(),
                        main_cooldown_until: cadence.cooldown_until(Which::Main),
                        pre_cooldown_until: cadence.cooldown_until(Which::Pre),
                        running_since: cadence.running_since(),
                    })
                    .collect();

                EngineStatus {
                    name: descriptor.name().to_string(),
                    state: descriptor.state(),
                    enabled: descriptor.is_enabled(),
                    priority: descriptor.priority(),
                    contexts: descriptor.contexts().to_vec(),
                    metadata: descriptor.metadata().clone(),
                    actions,
                    history: history.aggregate(descriptor.name()),
                    retained: history.len(descriptor.name()),
                    recent_failures: history.recent_errors(descriptor.name(), window),
                }
            })
            .collect();

        let due_now = scheduler
            .plan(now)
            .iter()
            .filter(|planned| !planned.blocked)
            .count();

        Self {
            state,
            now,
            engines,
            backlog: Backlog {
                in_flight: scheduler.in_flight(),
                queued_self_triggers,
                due_now,
            },
            sink_failures: history.sink_failures(),
            internal_errors: history.internal_errors(),
        }
    }

    pub fn engine(&self, name: &str) -> Option<&EngineStatus> {
        self.engines.iter().find(|engine| engine.name == name)
    }
}
