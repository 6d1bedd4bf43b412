//! Coordination engine: keeps queued work spread evenly across workers.
//!
//! The pre takes a load snapshot from a [`LoadSource`]; the main plans a
//! greedy rebalance over the latest snapshot and, when configured to, hands
//! the moves back to the source to apply.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::lock;
use crate::action::{Action, ActionContext, CompoundingAction};
use crate::engine::EngineDescriptor;
use crate::record::Payload;
use crate::trigger::COORDINATION_OPTIMIZATION;

/// Action name of the rebalance.
pub const REBALANCE_ACTION: &str = "rebalance";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub worker: String,
    /// Units of work the worker can hold. Workers with zero capacity are
    /// ignored.
    pub capacity: u32,
    pub queued: u32,
}

impl WorkerLoad {
    pub fn new(worker: impl Into<String>, capacity: u32, queued: u32) -> Self {
        Self {
            worker: worker.into(),
            capacity,
            queued,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMove {
    pub from: String,
    pub to: String,
    pub units: u32,
}

#[async_trait]
pub trait LoadSource: Send + Sync + 'static {
    async fn snapshot(&self) -> Result<Vec<WorkerLoad>>;

    /// Carry out a rebalance. Only called when the engine is configured to
    /// apply its plans.
    async fn apply(&self, _moves: &[WorkMove]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub main_interval: Duration,
    pub pre_fraction: Option<f64>,
    /// Allowed distance of any worker's utilization from the mean.
    pub tolerance: f64,
    /// Upper bound on planning steps per rebalance.
    pub max_moves: usize,
    pub apply: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            main_interval: Duration::from_secs(30),
            pre_fraction: None,
            tolerance: 0.1,
            max_moves: 64,
            apply: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalancePlan {
    pub workers: usize,
    pub mean_utilization: f64,
    pub spread_before: f64,
    pub spread_after: f64,
    pub moves: Vec<WorkMove>,
    pub balanced: bool,
}

struct Slot {
    worker: String,
    capacity: u32,
    queued: u32,
}

impl Slot {
    fn utilization(&self) -> f64 {
        self.queued as f64 / self.capacity as f64
    }
}

fn spread(slots: &[Slot]) -> f64 {
    let (min, max) = slots.iter().fold((f64::MAX, f64::MIN), |(min, max), slot| {
        let u = slot.utilization();
        (min.min(u), max.max(u))
    });
    if slots.is_empty() {
        0.0
    } else {
        max - min
    }
}

/// Index of the extreme slot by utilization; ties go to the lowest worker id.
fn extreme(slots: &[Slot], busiest: bool) -> Option<usize> {
    (0..slots.len()).reduce(|best, i| {
        let (u, b) = (slots[i].utilization(), slots[best].utilization());
        let better = if busiest { u > b } else { u < b };
        if better {
            i
        } else {
            best
        }
    })
}

/// Plan moves from the busiest to the idlest worker until every worker is
/// within `tolerance` of the mean utilization, no whole unit can move without
/// overshooting the mean, or `max_moves` steps were taken.
///
/// The plan is deterministic: workers are ordered by id before planning.
pub fn plan_rebalance(workers: &[WorkerLoad], tolerance: f64, max_moves: usize) -> RebalancePlan {
    let mut slots: Vec<Slot> = workers
        .iter()
        .filter(|w| w.capacity > 0)
        .map(|w| Slot {
            worker: w.worker.clone(),
            capacity: w.capacity,
            queued: w.queued,
        })
        .collect();
    slots.sort_by(|a, b| a.worker.cmp(&b.worker));

    let total_queued: u64 = slots.iter().map(|s| s.queued as u64).sum();
    let total_capacity: u64 = slots.iter().map(|s| s.capacity as u64).sum();
    let mean = if total_capacity == 0 {
        0.0
    } else {
        total_queued as f64 / total_capacity as f64
    };
    let within = |slots: &[Slot]| {
        slots
            .iter()
            .all(|s| (s.utilization() - mean).abs() <= tolerance)
    };

    let spread_before = spread(&slots);
    let mut moves: Vec<WorkMove> = Vec::new();

    for _ in 0..max_moves {
        if within(&slots) {
            break;
        }
        let (Some(over), Some(under)) = (extreme(&slots, true), extreme(&slots, false)) else {
            break;
        };
        let target = |slot: &Slot| mean * slot.capacity as f64;
        let excess = slots[over].queued as f64 - target(&slots[over]).ceil();
        let deficit = target(&slots[under]).floor() - slots[under].queued as f64;
        let units = excess.min(deficit);
        if over == under || units < 1.0 {
            break;
        }
        let units = units as u32;

        slots[over].queued -= units;
        slots[under].queued += units;
        let (from, to) = (slots[over].worker.clone(), slots[under].worker.clone());
        match moves.iter_mut().find(|m| m.from == from && m.to == to) {
            Some(existing) => existing.units += units,
            None => moves.push(WorkMove { from, to, units }),
        }
    }

    RebalancePlan {
        workers: slots.len(),
        mean_utilization: mean,
        spread_before,
        spread_after: spread(&slots),
        balanced: within(&slots),
        moves,
    }
}

struct Coordinator {
    source: Arc<dyn LoadSource>,
    config: CoordinationConfig,
    latest: Mutex<Option<Vec<WorkerLoad>>>,
}

struct SnapshotLoad(Arc<Coordinator>);

#[async_trait]
impl Action for SnapshotLoad {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        let loads = self.0.source.snapshot().await?;
        let total_queued: u64 = loads.iter().map(|w| w.queued as u64).sum();

        let mut payload = Payload::new();
        payload.insert("workers".into(), loads.len().into());
        payload.insert("total_queued".into(), total_queued.into());
        *lock(&self.0.latest) = Some(loads);
        Ok(payload)
    }
}

struct Rebalance(Arc<Coordinator>);

#[async_trait]
impl Action for Rebalance {
    async fn run(&self, _ctx: ActionContext) -> Result<Payload> {
        let snapshot = lock(&self.0.latest).take();
        let loads = match snapshot {
            Some(loads) => loads,
            None => self.0.source.snapshot().await?,
        };

        let config = &self.0.config;
        let plan = plan_rebalance(&loads, config.tolerance, config.max_moves);
        let applied = config.apply && !plan.moves.is_empty();
        if applied {
            self.0.source.apply(&plan.moves).await?;
        }
        debug!(
            moves = plan.moves.len(),
            balanced = plan.balanced,
            applied,
            "rebalance planned"
        );

        let mut payload = match serde_json::to_value(&plan)? {
            Value::Object(payload) => payload,
            other => bail!("plan serialized to {other}"),
        };
        payload.insert("applied".into(), applied.into());
        Ok(payload)
    }
}

/// An engine rebalancing the workers of `source`, handling
/// `coordination_optimization` triggers.
pub fn coordination_engine(
    name: impl Into<String>,
    source: impl LoadSource,
    config: CoordinationConfig,
) -> EngineDescriptor {
    let main_interval = config.main_interval;
    let pre_fraction = config.pre_fraction;
    let coordinator = Arc::new(Coordinator {
        source: Arc::new(source),
        config,
        latest: Mutex::new(None),
    });

    let mut action = CompoundingAction::new(
        REBALANCE_ACTION,
        main_interval,
        Rebalance(coordinator.clone()),
    )
    .with_pre(SnapshotLoad(coordinator));
    if let Some(fraction) = pre_fraction {
        action = action.with_pre_fraction(fraction);
    }

    EngineDescriptor::new(name)
        .handles(COORDINATION_OPTIMIZATION)
        .with_metadata("kind", "coordination")
        .with_action(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Orchestrator;
    use crate::trigger::Trigger;

    #[test]
    fn moves_excess_to_the_idlest_worker() {
        let workers = [
            WorkerLoad::new("a", 10, 9),
            WorkerLoad::new("b", 10, 1),
            WorkerLoad::new("c", 10, 5),
        ];
        let plan = plan_rebalance(&workers, 0.1, 64);

        assert_eq!(plan.mean_utilization, 0.5);
        assert!((plan.spread_before - 0.8).abs() < 1e-9);
        assert_eq!(
            plan.moves,
            vec![WorkMove {
                from: "a".into(),
                to: "b".into(),
                units: 4
            }]
        );
        assert_eq!(plan.spread_after, 0.0);
        assert!(plan.balanced);
    }

    #[test]
    fn balanced_fleet_needs_no_moves() {
        let workers = [WorkerLoad::new("a", 4, 2), WorkerLoad::new("b", 8, 4)];
        let plan = plan_rebalance(&workers, 0.05, 64);
        assert!(plan.moves.is_empty());
        assert!(plan.balanced);
    }

    #[test]
    fn zero_capacity_workers_are_ignored() {
        let workers = [
            WorkerLoad::new("dead", 0, 7),
            WorkerLoad::new("a", 10, 6),
            WorkerLoad::new("b", 10, 4),
        ];
        let plan = plan_rebalance(&workers, 0.0, 64);
        assert_eq!(plan.workers, 2);
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].units, 1);
        assert!(plan.balanced);
    }

    #[test]
    fn indivisible_load_stops_without_oscillating() {
        // Mean 0.5 cannot be reached exactly with one unit on two workers.
        let workers = [WorkerLoad::new("a", 1, 1), WorkerLoad::new("b", 1, 0)];
        let plan = plan_rebalance(&workers, 0.1, 64);
        assert!(plan.moves.is_empty());
        assert!(!plan.balanced);
    }

    #[test]
    fn step_limit_bounds_the_plan() {
        let workers = [
            WorkerLoad::new("a", 10, 10),
            WorkerLoad::new("b", 10, 0),
            WorkerLoad::new("c", 10, 10),
            WorkerLoad::new("d", 10, 0),
        ];
        let plan = plan_rebalance(&workers, 0.0, 1);
        assert_eq!(plan.moves.len(), 1);
        assert!(!plan.balanced);
    }

    struct Fleet {
        loads: Vec<WorkerLoad>,
        applied: Mutex<Vec<WorkMove>>,
    }

    #[async_trait]
    impl LoadSource for Arc<Fleet> {
        async fn snapshot(&self) -> Result<Vec<WorkerLoad>> {
            Ok(self.loads.clone())
        }

        async fn apply(&self, moves: &[WorkMove]) -> Result<()> {
            lock(&self.applied).extend_from_slice(moves);
            Ok(())
        }
    }

    #[tokio::test]
    async fn triggered_rebalance_applies_moves() {
        let fleet = Arc::new(Fleet {
            loads: vec![WorkerLoad::new("a", 10, 8), WorkerLoad::new("b", 10, 2)],
            applied: Mutex::new(Vec::new()),
        });
        let clock = ManualClock::new();
        let orchestrator =
            Orchestrator::new(Arc::new(clock.clone()), OrchestratorConfig::default()).unwrap();
        orchestrator
            .register(coordination_engine(
                "coordinator",
                fleet.clone(),
                CoordinationConfig {
                    apply: true,
                    ..CoordinationConfig::default()
                },
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        let records = orchestrator
            .trigger(Trigger::new(COORDINATION_OPTIMIZATION))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
        assert_eq!(records[0].payload["applied"], true);
        assert_eq!(records[0].payload["balanced"], true);
        assert_eq!(
            *lock(&fleet.applied),
            vec![WorkMove {
                from: "a".into(),
                to: "b".into(),
                units: 3
            }]
        );
    }
}
