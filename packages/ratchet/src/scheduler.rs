//! The scheduler: turns cadences into dispatch decisions.
//!
//! All scheduling state lives here and is only touched under the
//! orchestrator's lock. In-flight invocations are boxed futures held in
//! dispatch order and polled by whoever ticks the scheduler (the background
//! driver or a manual `advance()`), never spawned as their own tasks.
//!
//! # One Tick
//!
//! ```text
//! tick(now)
//!   ├─ poll in-flight invocations, apply finished ones
//!   ├─ arm cadences of engines seen running for the first time
//!   ├─ dispatch queued self-triggers
//!   ├─ plan(now) ─► overrun records for blocked actions
//!   │             └► dispatch pre (then main) / main
//!   └─ poll the new invocations once
//! ```
//!
//! Plan order is priority ascending, engine registration order, action order,
//! and pre before main. A pre and a main due together run as one sequential
//! pass, so the main sees the fresh pre output.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{invoke, ActionContext, Cadence, CadenceChange, Invocation, Which};
use crate::clock::{Clock, Timestamp};
use crate::config::OrchestratorConfig;
use crate::engine::{EngineDescriptor, EngineHandle, EngineState, SelfTriggerQueue};
use crate::error::{RatchetError, Result};
use crate::history::HistoryStore;
use crate::record::{reason_payload, Cause, ExecutionRecord, Outcome, Payload};
use crate::trigger::{TriggerRouter, TriggerRule, SELF_CONTEXT};

/// One invocation the scheduler would make at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedInvocation {
    pub engine: String,
    pub action: String,
    pub which: Which,
    /// The action is still running; this entry becomes an overrun record.
    pub blocked: bool,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub at: Timestamp,
    pub dispatched: usize,
    pub completed: usize,
    pub overruns: usize,
    pub in_flight: usize,
}

pub(crate) struct EngineEntry {
    pub descriptor: EngineDescriptor,
    pub cadences: Vec<Cadence>,
    pub handle: EngineHandle,
}

impl EngineEntry {
    fn schedulable(&self) -> bool {
        self.descriptor.state == EngineState::Running && self.descriptor.enabled
    }
}

struct InflightSlot {
    engine: usize,
    action: usize,
    which: Which,
    cause: Cause,
    started_at: Timestamp,
    /// Run the main right after this pre completes.
    then_main: bool,
    future: BoxFuture<'static, Invocation>,
}

/// Per-action decision for one instant.
struct Decision {
    engine: usize,
    action: usize,
    pre: bool,
    main: bool,
    blocked: bool,
}

/// Outcome of asking to run a triggered main.
pub(crate) enum TriggerStart {
    /// The action is busy; the skip record was already appended.
    Skipped(ExecutionRecord),
    Run(BoxFuture<'static, Invocation>),
}

pub(crate) struct Scheduler {
    pub clock: Arc<dyn Clock>,
    pub config: OrchestratorConfig,
    pub history: Arc<HistoryStore>,
    pub self_triggers: Arc<SelfTriggerQueue>,
    pub engines: Vec<EngineEntry>,
    index: HashMap<String, usize>,
    router: TriggerRouter,
    inflight: Vec<InflightSlot>,
    /// Cleared once a stop is requested; nothing new is dispatched.
    accepting: bool,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        history: Arc<HistoryStore>,
        self_triggers: Arc<SelfTriggerQueue>,
    ) -> Self {
        Self {
            clock,
            config,
            history,
            self_triggers,
            engines: Vec::new(),
            index: HashMap::new(),
            router: TriggerRouter::new(),
            inflight: Vec::new(),
            accepting: true,
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub fn register(&mut self, descriptor: EngineDescriptor) -> Result<EngineHandle> {
        if self.index.contains_key(descriptor.name()) {
            return Err(RatchetError::DuplicateEngine {
                name: descriptor.name().to_string(),
            });
        }
        if matches!(
            descriptor.state(),
            EngineState::Stopped | EngineState::Disposed
        ) {
            return Err(RatchetError::InvalidState(format!(
                "engine '{}' is {} and cannot be registered",
                descriptor.name(),
                descriptor.state()
            )));
        }
        let pre_intervals = descriptor.validate(self.config.default_compounding_fraction)?;

        let cadences = descriptor
            .actions
            .iter()
            .zip(pre_intervals)
            .map(|(action, pre_interval)| {
                Cadence::new(
                    action.main_interval(),
                    pre_interval,
                    self.config.failure_window_size,
                )
            })
            .collect();
        let handle = EngineHandle::new(
            descriptor.name(),
            self.clock.clone(),
            self.history.clone(),
            self.self_triggers.clone(),
        );
        self.router.add(
            TriggerRule::new(
                descriptor.name(),
                descriptor.priority(),
                descriptor.contexts().to_vec(),
            )
            .with_predicate(descriptor.predicate.clone()),
        );

        info!(
            engine = %descriptor.name(),
            actions = descriptor.actions().len(),
            priority = descriptor.priority(),
            "engine registered"
        );
        self.index
            .insert(descriptor.name().to_string(), self.engines.len());
        self.engines.push(EngineEntry {
            descriptor,
            cadences,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    pub fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| RatchetError::UnknownEngine {
                name: name.to_string(),
            })
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines
            .iter()
            .map(|entry| entry.descriptor.name().to_string())
            .collect()
    }

    pub fn route(&self, context: &str, payload: &Payload) -> Vec<String> {
        self.router.route(context, payload)
    }

    /// Engine indices in plan order: priority, then registration.
    fn ordered_engines(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.engines.len()).collect();
        order.sort_by_key(|&i| (self.engines[i].descriptor.priority(), i));
        order
    }

    pub fn set_priority(&mut self, engine: usize, priority: i32) {
        let entry = &mut self.engines[engine];
        entry.descriptor.priority = priority;
        self.router.set_priority(entry.descriptor.name(), priority);
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    // =========================================================================
    // Planning
    // =========================================================================

    fn decide(&self, now: Timestamp) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for engine in self.ordered_engines() {
            let entry = &self.engines[engine];
            if !entry.schedulable() {
                continue;
            }
            for (action, cadence) in entry.cadences.iter().enumerate() {
                let decision = if cadence.is_running() {
                    Decision {
                        engine,
                        action,
                        pre: false,
                        main: false,
                        blocked: cadence.overrun_due(now),
                    }
                } else {
                    Decision {
                        engine,
                        action,
                        pre: cadence.due_pre(now),
                        main: cadence.due_main(now),
                        blocked: false,
                    }
                };
                if decision.pre || decision.main || decision.blocked {
                    decisions.push(decision);
                }
            }
        }
        decisions
    }

    /// The invocations due at `now`, in dispatch order. Read-only.
    pub fn plan(&self, now: Timestamp) -> Vec<PlannedInvocation> {
        let mut planned = Vec::new();
        for decision in self.decide(now) {
            let entry = &self.engines[decision.engine];
            let action = entry.descriptor.actions[decision.action].name();
            let mut push = |which, blocked| {
                planned.push(PlannedInvocation {
                    engine: entry.descriptor.name().to_string(),
                    action: action.to_string(),
                    which,
                    blocked,
                })
            };
            if decision.blocked {
                push(Which::Main, true);
            }
            if decision.pre {
                push(Which::Pre, false);
            }
            if decision.main {
                push(Which::Main, false);
            }
        }
        planned
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Run one scheduling pass at `now`.
    pub fn tick(&mut self, now: Timestamp, cx: &mut Context<'_>) -> TickReport {
        let mut report = TickReport {
            at: now,
            ..TickReport::default()
        };
        report.completed += self.poll_inflight(cx);

        if self.accepting {
            self.arm(now);
            report.dispatched += self.dispatch_self_triggers(now, &mut report);

            for decision in self.decide(now) {
                if decision.blocked {
                    self.record_overrun(decision.engine, decision.action, now);
                    report.overruns += 1;
                } else if decision.pre {
                    self.dispatch(
                        decision.engine,
                        decision.action,
                        Which::Pre,
                        None,
                        Payload::new(),
                        decision.main,
                    );
                    report.dispatched += 1;
                } else if decision.main {
                    self.dispatch(
                        decision.engine,
                        decision.action,
                        Which::Main,
                        None,
                        Payload::new(),
                        false,
                    );
                    report.dispatched += 1;
                }
            }

            report.completed += self.poll_inflight(cx);
        }

        report.in_flight = self.inflight.len();
        report
    }

    fn arm(&mut self, now: Timestamp) {
        for entry in self.engines.iter_mut().filter(|e| e.schedulable()) {
            for cadence in entry.cadences.iter_mut().filter(|c| !c.is_armed()) {
                cadence.arm(now);
            }
        }
    }

    fn dispatch_self_triggers(&mut self, now: Timestamp, report: &mut TickReport) -> usize {
        let mut dispatched = 0;
        for name in self.self_triggers.drain() {
            let Some(&engine) = self.index.get(&name) else {
                continue;
            };
            if !self.engines[engine].schedulable() {
                debug!(engine = %name, "dropping self-trigger for inactive engine");
                continue;
            }
            for action in 0..self.engines[engine].cadences.len() {
                if self.engines[engine].cadences[action].is_running() {
                    self.record_overrun(engine, action, now);
                    report.overruns += 1;
                    continue;
                }
                self.dispatch(
                    engine,
                    action,
                    Which::Main,
                    Some(Cause::Triggered(SELF_CONTEXT.to_string())),
                    Payload::new(),
                    false,
                );
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Start one invocation and keep it in flight.
    ///
    /// `cause` defaults to the cadence cause for `which`.
    fn dispatch(
        &mut self,
        engine: usize,
        action: usize,
        which: Which,
        cause: Option<Cause>,
        trigger_payload: Payload,
        then_main: bool,
    ) {
        let now = self.clock.now();
        let entry = &mut self.engines[engine];
        let compounding = &entry.descriptor.actions[action];
        let cause = cause.unwrap_or_else(|| match which {
            Which::Main => Cause::Scheduled,
            Which::Pre => Cause::PreFor(compounding.name().to_string()),
        });

        let callable = match which {
            Which::Main => compounding.main.clone(),
            Which::Pre => match &compounding.pre {
                Some(pre) => pre.clone(),
                None => return,
            },
        };
        let pre_output = match which {
            Which::Main if compounding.is_chained() => entry.cadences[action].pre_output().cloned(),
            _ => None,
        };

        debug!(
            engine = %entry.descriptor.name(),
            action = %compounding.name(),
            %which,
            %cause,
            "dispatching"
        );
        let ctx = ActionContext::new(
            compounding.name(),
            which,
            cause.clone(),
            trigger_payload,
            pre_output,
            entry.handle.clone(),
        );
        let future = invoke(callable, ctx, self.clock.clone(), self.config.action_timeout);

        entry.cadences[action].mark_running(now);
        self.inflight.push(InflightSlot {
            engine,
            action,
            which,
            cause,
            started_at: now,
            then_main,
            future,
        });
    }

    /// Poll every in-flight invocation once, applying those that finished.
    /// Returns the number of invocations that finished.
    pub fn poll_inflight(&mut self, cx: &mut Context<'_>) -> usize {
        let mut completed = 0;
        let mut i = 0;
        while i < self.inflight.len() {
            match self.inflight[i].future.as_mut().poll(cx) {
                Poll::Ready(invocation) => {
                    let slot = self.inflight.remove(i);
                    completed += 1;
                    if let Some(next) = self.complete(slot, invocation) {
                        // The chained main takes the pre's place and is polled next.
                        self.inflight.insert(i, next);
                    }
                }
                Poll::Pending => i += 1,
            }
        }
        completed
    }

    fn complete(&mut self, slot: InflightSlot, invocation: Invocation) -> Option<InflightSlot> {
        let threshold = self.config.failure_threshold;
        let entry = &mut self.engines[slot.engine];
        let compounding = &entry.descriptor.actions[slot.action];
        let cadence = &mut entry.cadences[slot.action];
        let cooldown = self.config.failure_cooldown(cadence.interval());

        if slot.cause.is_cadence() {
            let change = cadence.record(
                slot.which,
                invocation.outcome,
                invocation.started_at,
                invocation.finished_at,
                &invocation.payload,
                threshold,
                cooldown,
            );
            if let CadenceChange::CooldownUntil(until) = change {
                warn!(
                    engine = %entry.descriptor.name(),
                    action = %compounding.name(),
                    which = %slot.which,
                    %until,
                    "failure threshold reached, cooling down"
                );
            }
        }

        let record = ExecutionRecord::new(
            entry.descriptor.name(),
            compounding.name(),
            invocation.started_at,
            invocation.finished_at,
            invocation.outcome,
            slot.cause.clone(),
            invocation.payload,
        );
        if record.is_error() {
            warn!(
                engine = %record.engine,
                action = %record.action,
                cause = %record.cause,
                reason = record.reason().unwrap_or_default(),
                "invocation failed"
            );
        }
        self.history.append(record);

        let engine = slot.engine;
        let action = slot.action;
        self.engines[engine].cadences[action].mark_idle();

        if slot.then_main && self.accepting {
            let before = self.inflight.len();
            self.dispatch(engine, action, Which::Main, None, Payload::new(), false);
            if self.inflight.len() > before {
                return self.inflight.pop();
            }
        }
        None
    }

    fn record_overrun(&mut self, engine: usize, action: usize, now: Timestamp) {
        let entry = &mut self.engines[engine];
        let name = entry.descriptor.actions[action].name().to_string();
        entry.cadences[action].mark_overrun(now);
        warn!(
            engine = %entry.descriptor.name(),
            action = %name,
            "previous invocation still running, skipping"
        );
        let record = ExecutionRecord::skipped(
            entry.descriptor.name(),
            name,
            now,
            Cause::Overrun,
            "overrun",
        );
        self.history.append(record);
    }

    /// Drop every in-flight invocation, recording each as `skipped` with
    /// cause `shutdown`. Returns how many were abandoned.
    pub fn abandon_inflight(&mut self, now: Timestamp) -> usize {
        let abandoned: Vec<InflightSlot> = self.inflight.drain(..).collect();
        let count = abandoned.len();
        for slot in abandoned {
            let entry = &mut self.engines[slot.engine];
            entry.cadences[slot.action].mark_idle();
            let mut payload = reason_payload("shutdown");
            payload.insert("interrupted".to_string(), slot.cause.to_string().into());
            let record = ExecutionRecord::new(
                entry.descriptor.name(),
                entry.descriptor.actions[slot.action].name(),
                slot.started_at,
                now,
                Outcome::Skipped,
                Cause::Shutdown,
                payload,
            );
            warn!(
                engine = %record.engine,
                action = %record.action,
                "abandoning in-flight invocation"
            );
            self.history.append(record);
        }
        count
    }

    /// Move every running engine to `stopped`.
    pub fn stop_engines(&mut self) {
        for entry in &mut self.engines {
            if entry.descriptor.state() == EngineState::Running {
                if let Err(e) = entry.descriptor.transition(EngineState::Stopped) {
                    warn!(error = %e, "failed to stop engine");
                }
            }
        }
    }

    /// Initialize every `created` engine and start every `initialized` one.
    pub fn start_engines(&mut self) {
        for index in 0..self.engines.len() {
            self.start_engine(index);
        }
    }

    /// Bring one engine up to `running` if it can get there.
    pub fn start_engine(&mut self, index: usize) {
        let descriptor = &mut self.engines[index].descriptor;
        if descriptor.state() == EngineState::Created {
            if let Err(e) = descriptor.initialize() {
                warn!(engine = %descriptor.name(), error = %e, "engine failed to initialize");
                return;
            }
        }
        if descriptor.state() == EngineState::Initialized {
            match descriptor.transition(EngineState::Running) {
                Ok(()) => info!(engine = %descriptor.name(), "engine running"),
                Err(e) => warn!(error = %e, "failed to start engine"),
            }
        }
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Begin a triggered run of one main action.
    ///
    /// A busy action yields a `skipped`/`overrun` record instead; otherwise the
    /// action is marked running until [`finish_trigger`](Self::finish_trigger)
    /// or [`release`](Self::release).
    pub fn start_trigger(
        &mut self,
        engine: usize,
        action: usize,
        context: &str,
        payload: &Payload,
    ) -> TriggerStart {
        let now = self.clock.now();
        if self.engines[engine].cadences[action].is_running() {
            let entry = &self.engines[engine];
            let record = ExecutionRecord::skipped(
                entry.descriptor.name(),
                entry.descriptor.actions[action].name(),
                now,
                Cause::Overrun,
                "overrun",
            );
            self.history.append(record.clone());
            return TriggerStart::Skipped(record);
        }

        let entry = &mut self.engines[engine];
        let compounding = &entry.descriptor.actions[action];
        let pre_output = if compounding.is_chained() {
            entry.cadences[action].pre_output().cloned()
        } else {
            None
        };
        let ctx = ActionContext::new(
            compounding.name(),
            Which::Main,
            Cause::Triggered(context.to_string()),
            payload.clone(),
            pre_output,
            entry.handle.clone(),
        );
        let future = invoke(
            compounding.main.clone(),
            ctx,
            self.clock.clone(),
            self.config.action_timeout,
        );
        entry.cadences[action].mark_running(now);
        TriggerStart::Run(future)
    }

    /// Record a finished triggered run. Cadence state is left untouched.
    pub fn finish_trigger(
        &mut self,
        engine: usize,
        action: usize,
        context: &str,
        invocation: Invocation,
    ) -> ExecutionRecord {
        self.release(engine, action);
        let entry = &self.engines[engine];
        let record = ExecutionRecord::new(
            entry.descriptor.name(),
            entry.descriptor.actions[action].name(),
            invocation.started_at,
            invocation.finished_at,
            invocation.outcome,
            Cause::Triggered(context.to_string()),
            invocation.payload,
        );
        if record.is_error() {
            warn!(
                engine = %record.engine,
                action = %record.action,
                cause = %record.cause,
                reason = record.reason().unwrap_or_default(),
                "triggered invocation failed"
            );
        }
        self.history.append(record.clone());
        record
    }

    /// Clear the busy mark a triggered run set.
    pub fn release(&mut self, engine: usize, action: usize) {
        self.engines[engine].cadences[action].mark_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{action_fn, CompoundingAction};
    use crate::clock::ManualClock;
    use futures::task::noop_waker_ref;
    use std::time::Duration;

    fn scheduler(clock: &ManualClock) -> Scheduler {
        let config = OrchestratorConfig::default();
        Scheduler::new(
            Arc::new(clock.clone()),
            config,
            Arc::new(HistoryStore::new(100, 10)),
            Arc::new(SelfTriggerQueue::default()),
        )
    }

    fn engine(name: &str, priority: i32, actions: &[&str]) -> EngineDescriptor {
        let mut descriptor = EngineDescriptor::new(name).with_priority(priority);
        for action in actions {
            descriptor = descriptor.with_action(
                CompoundingAction::new(
                    *action,
                    Duration::from_millis(100),
                    action_fn(|_| async { Ok(Payload::new()) }),
                )
                .with_pre(action_fn(|_| async { Ok(Payload::new()) })),
            );
        }
        descriptor
    }

    fn tick(scheduler: &mut Scheduler, clock: &ManualClock) -> TickReport {
        let mut cx = Context::from_waker(noop_waker_ref());
        scheduler.tick(clock.now(), &mut cx)
    }

    #[test]
    fn plan_orders_by_priority_then_registration() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        scheduler.register(engine("low", 5, &["a"])).unwrap();
        scheduler.register(engine("high", 1, &["x", "y"])).unwrap();
        scheduler.start_engines();
        tick(&mut scheduler, &clock);

        clock.advance(Duration::from_millis(100));
        let plan: Vec<(String, String, Which)> = scheduler
            .plan(clock.now())
            .into_iter()
            .map(|p| (p.engine, p.action, p.which))
            .collect();

        let expected = [
            ("high", "x", Which::Pre),
            ("high", "x", Which::Main),
            ("high", "y", Which::Pre),
            ("high", "y", Which::Main),
            ("low", "a", Which::Pre),
            ("low", "a", Which::Main),
        ];
        assert_eq!(plan.len(), expected.len());
        for (got, want) in plan.iter().zip(expected) {
            assert_eq!((got.0.as_str(), got.1.as_str(), got.2), want);
        }
    }

    #[test]
    fn non_running_engines_are_not_planned() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        scheduler.register(engine("idle", 0, &["a"])).unwrap();
        tick(&mut scheduler, &clock);

        clock.advance(Duration::from_secs(10));
        assert!(scheduler.plan(clock.now()).is_empty());
    }

    #[test]
    fn pre_and_main_run_as_one_pass() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        scheduler.register(engine("e", 0, &["a"])).unwrap();
        scheduler.start_engines();
        tick(&mut scheduler, &clock);

        clock.advance(Duration::from_millis(100));
        let report = tick(&mut scheduler, &clock);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.completed, 2);
        assert_eq!(report.in_flight, 0);

        let records = scheduler.history.recent("e", 10);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_pre());
        assert_eq!(records[1].cause, Cause::Scheduled);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        scheduler.register(engine("e", 0, &["a"])).unwrap();
        assert!(matches!(
            scheduler.register(engine("e", 0, &["b"])),
            Err(RatchetError::DuplicateEngine { .. })
        ));
        assert_eq!(scheduler.engine_names(), vec!["e"]);
    }

    #[test]
    fn stopped_descriptors_are_rejected() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        let mut descriptor = engine("e", 0, &["a"]);
        descriptor.initialize().unwrap();
        descriptor.transition(EngineState::Running).unwrap();
        descriptor.transition(EngineState::Stopped).unwrap();

        assert!(matches!(
            scheduler.register(descriptor),
            Err(RatchetError::InvalidState(_))
        ));
    }

    #[test]
    fn abandoned_invocations_are_recorded_as_shutdown() {
        let clock = ManualClock::new();
        let mut scheduler = scheduler(&clock);
        scheduler
            .register(EngineDescriptor::new("slow").with_action(CompoundingAction::new(
                "wait",
                Duration::from_millis(10),
                action_fn(|_| std::future::pending()),
            )))
            .unwrap();
        scheduler.start_engines();
        tick(&mut scheduler, &clock);
        clock.advance(Duration::from_millis(10));
        tick(&mut scheduler, &clock);
        assert_eq!(scheduler.in_flight(), 1);

        clock.advance(Duration::from_millis(5));
        assert_eq!(scheduler.abandon_inflight(clock.now()), 1);

        let records = scheduler.history.recent("slow", 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cause, Cause::Shutdown);
        assert_eq!(records[0].outcome, Outcome::Skipped);
        assert_eq!(records[0].payload["interrupted"], "scheduled");
        assert_eq!(records[0].duration(), Duration::from_millis(5));
    }
}
