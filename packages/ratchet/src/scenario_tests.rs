//! End-to-end scenarios and scheduling invariants.
//!
//! Everything here runs through the public orchestrator API under a
//! [`ManualClock`], except the graceful-stop scenario which drives the
//! background task on tokio's paused clock.

#[cfg(test)]
mod scenarios {
    use crate::action::{action_fn, Action, CompoundingAction};
    use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
    use crate::config::OrchestratorConfig;
    use crate::engine::{EngineDescriptor, EngineState};
    use crate::orchestrator::{Orchestrator, StopOptions};
    use crate::record::{Cause, ExecutionRecord, Outcome, Payload};
    use crate::testing::{drive, init_tracing, RecordingSink, ScriptedAction, SleepyAction, Step};
    use crate::trigger::{Trigger, FAILURE_PREVENTION, MANUAL, SUBSCRIPTION_RESOLUTION, WILDCARD};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn manual(config: OrchestratorConfig) -> (ManualClock, Orchestrator) {
        init_tracing();
        let clock = ManualClock::new();
        let orchestrator = Orchestrator::new(Arc::new(clock.clone()), config).unwrap();
        (clock, orchestrator)
    }

    fn ok_action() -> impl Action {
        action_fn(|_| async { Ok(Payload::new()) })
    }

    fn single(name: &str, action: CompoundingAction) -> EngineDescriptor {
        EngineDescriptor::new(name).handles(MANUAL).with_action(action)
    }

    /// Executed (non-skipped) records grouped per action, in append order.
    fn executed_by_action(records: &[ExecutionRecord]) -> BTreeMap<String, Vec<&ExecutionRecord>> {
        let mut grouped: BTreeMap<String, Vec<&ExecutionRecord>> = BTreeMap::new();
        for record in records.iter().filter(|r| !r.is_skipped()) {
            grouped.entry(record.action.clone()).or_default().push(record);
        }
        grouped
    }

    fn assert_no_self_concurrency(records: &[ExecutionRecord]) {
        for (action, mut runs) in executed_by_action(records) {
            runs.sort_by_key(|r| r.started_at);
            for pair in runs.windows(2) {
                assert!(
                    pair[0].finished_at <= pair[1].started_at,
                    "{action}: run at {} overlaps run at {}",
                    pair[0].started_at,
                    pair[1].started_at
                );
                assert!(pair[0].finished_at <= pair[1].finished_at);
            }
        }
    }

    fn assert_cadence_floor(records: &[ExecutionRecord], interval: Duration) {
        let mains: Vec<&ExecutionRecord> = records
            .iter()
            .filter(|r| r.is_ok() && r.cause == Cause::Scheduled)
            .collect();
        for pair in mains.windows(2) {
            assert!(
                pair[1].started_at - pair[0].started_at >= interval,
                "mains at {} and {} closer than {interval:?}",
                pair[0].started_at,
                pair[1].started_at
            );
        }
    }

    // ==========================================================================
    // Scenarios
    // ==========================================================================

    #[tokio::test]
    async fn test_simple_compounding_cadence() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new("improve", ms(100), ok_action()).with_pre(ok_action()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(1000), ms(10)).await.unwrap();

        let records = orchestrator.history("e", 1000).unwrap();
        let mains = records.iter().filter(|r| r.is_ok() && !r.is_pre()).count();
        let pres = records.iter().filter(|r| r.is_ok() && r.is_pre()).count();
        assert_eq!(mains, 10);
        assert_eq!(pres, 40);
        assert!(records.iter().all(|r| r.is_ok()));

        // Pres land on the quarter slots of each main cycle.
        let pre_starts: Vec<u128> = records
            .iter()
            .filter(|r| r.is_pre())
            .take(4)
            .map(|r| r.started_at.as_millis())
            .collect();
        assert_eq!(pre_starts, vec![30, 50, 80, 100]);
    }

    #[tokio::test]
    async fn test_failure_cooldown() {
        let config = OrchestratorConfig::default().with_minimum_failure_cooldown(ms(500));
        let (clock, orchestrator) = manual(config);
        let action = ScriptedAction::failing_first(5);
        orchestrator
            .register(single(
                "flaky",
                CompoundingAction::new("improve", ms(100), action.clone()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        for report in drive(&orchestrator, &clock, at(2000), ms(10)).await.unwrap() {
            assert_eq!(report.overruns, 0);
        }

        let records = orchestrator.history("flaky", 1000).unwrap();
        assert!(records.len() < 20, "{} records", records.len());

        let errors: Vec<u128> = records
            .iter()
            .filter(|r| r.is_error())
            .map(|r| r.started_at.as_millis())
            .collect();
        assert_eq!(errors, vec![100, 110, 120, 620, 1120]);

        let first_ok = records.iter().find(|r| r.is_ok()).unwrap();
        assert!(first_ok.started_at - at(120) >= ms(500));
        assert_eq!(first_ok.started_at, at(1620));
        assert_eq!(records.len(), 9);
        assert_eq!(action.calls(), 9);
    }

    #[tokio::test]
    async fn test_overrun_is_skipped_not_queued() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        let sleepy = SleepyAction::new(Arc::new(clock.clone()), ms(250));
        orchestrator
            .register(single(
                "slow",
                CompoundingAction::new("improve", ms(100), sleepy.clone()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(1000), ms(10)).await.unwrap();

        let records = orchestrator.history("slow", 1000).unwrap();
        let ok = records.iter().filter(|r| r.is_ok()).count();
        let overruns = records
            .iter()
            .filter(|r| r.is_skipped() && r.cause == Cause::Overrun)
            .count();
        assert!(ok <= 4);
        assert!(overruns >= 6);
        assert_eq!((ok, overruns), (3, 7));
        assert!(records
            .iter()
            .filter(|r| r.is_skipped())
            .all(|r| r.reason() == Some("overrun")));
        // The fourth run is still in flight at 1000 ms.
        assert_eq!(sleepy.calls(), 4);
    }

    #[tokio::test]
    async fn test_trigger_routes_by_context() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        let engine = |name: &str, context: &str| {
            EngineDescriptor::new(name)
                .handles(context)
                .with_action(CompoundingAction::new("improve", ms(100), ok_action()))
        };
        orchestrator
            .register(engine("e1", SUBSCRIPTION_RESOLUTION))
            .unwrap();
        orchestrator.register(engine("e2", FAILURE_PREVENTION)).unwrap();
        orchestrator.register(engine("e3", WILDCARD)).unwrap();
        orchestrator.start_manual().unwrap();
        orchestrator.advance().await.unwrap();
        clock.advance(ms(50));

        let before = orchestrator.status();
        let records = orchestrator
            .trigger(Trigger::new(SUBSCRIPTION_RESOLUTION))
            .await
            .unwrap();

        let engines: Vec<&str> = records.iter().map(|r| r.engine.as_str()).collect();
        assert_eq!(engines, vec!["e1", "e3"]);
        assert!(records
            .iter()
            .all(|r| r.cause == Cause::Triggered(SUBSCRIPTION_RESOLUTION.into())));

        let after = orchestrator.status();
        assert!(orchestrator.history("e2", 10).unwrap().is_empty());
        for name in ["e1", "e2", "e3"] {
            assert_eq!(
                before.engine(name).unwrap().actions,
                after.engine(name).unwrap().actions,
                "cadence of {name} moved"
            );
        }
        assert_eq!(
            after.engine("e2").unwrap().actions[0].last_main_at,
            Some(Timestamp::ZERO)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_lets_inflight_finish() {
        init_tracing();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let config = OrchestratorConfig::default().with_tick_interval(ms(10));
        let orchestrator = Orchestrator::new(clock.clone(), config).unwrap();
        orchestrator
            .register(single(
                "worker",
                CompoundingAction::new("improve", ms(10), SleepyAction::new(clock.clone(), ms(50))),
            ))
            .unwrap();
        orchestrator.start().unwrap();

        tokio::time::sleep(ms(200)).await;
        let stop_at = orchestrator.now();
        orchestrator
            .stop_with(StopOptions::graceful(ms(100)))
            .await
            .unwrap();

        let records = orchestrator.history("worker", 1000).unwrap();
        assert!(records.iter().all(|r| r.cause != Cause::Shutdown));
        assert!(records.iter().all(|r| r.started_at <= stop_at));
        assert!(records
            .iter()
            .filter(|r| !r.is_skipped())
            .all(|r| r.is_ok()));
        let drained = records
            .iter()
            .find(|r| r.is_ok() && r.started_at < stop_at && r.finished_at >= stop_at);
        assert!(drained.is_some(), "no invocation was drained: {records:?}");

        // Nothing new once stopped.
        let count = records.len();
        tokio::time::sleep(ms(200)).await;
        assert_eq!(orchestrator.history("worker", 1000).unwrap().len(), count);
    }

    /// Helper to start a background orchestrator whose only action sleeps
    /// for a second, far longer than any stop below waits.
    fn long_running(clock: Arc<dyn Clock>) -> Orchestrator {
        init_tracing();
        let config = OrchestratorConfig::default().with_tick_interval(ms(10));
        let orchestrator = Orchestrator::new(clock.clone(), config).unwrap();
        orchestrator
            .register(single(
                "slow",
                CompoundingAction::new("improve", ms(100), SleepyAction::new(clock, ms(1000))),
            ))
            .unwrap();
        orchestrator.start().unwrap();
        orchestrator
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_while_draining_abandons_inflight() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let orchestrator = long_running(clock);

        tokio::time::sleep(ms(150)).await;
        let stop_at = orchestrator.now();
        let (graceful, hard) = tokio::join!(
            orchestrator.stop_with(StopOptions::graceful(Duration::from_secs(10))),
            async {
                tokio::time::sleep(ms(20)).await;
                orchestrator.stop_with(StopOptions::hard()).await
            }
        );
        graceful.unwrap();
        hard.unwrap();

        let records = orchestrator.history("slow", 100).unwrap();
        let shutdown: Vec<&ExecutionRecord> =
            records.iter().filter(|r| r.cause == Cause::Shutdown).collect();
        assert_eq!(shutdown.len(), 1, "{records:?}");
        let abandoned = shutdown[0];
        assert!(abandoned.is_skipped());
        assert_eq!(abandoned.reason(), Some("shutdown"));
        assert!(abandoned.started_at >= at(100) && abandoned.started_at < stop_at);
        // Abandoned at the hard stop, long before the grace period or the sleep ran out.
        assert!(abandoned.finished_at >= stop_at + ms(20));
        assert!(abandoned.finished_at < at(1100));
        assert!(records.iter().all(|r| !r.is_ok()));
        assert_eq!(orchestrator.engine_state("slow").unwrap(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_grace_period_abandons_inflight() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let orchestrator = long_running(clock);

        tokio::time::sleep(ms(150)).await;
        let stop_at = orchestrator.now();
        orchestrator
            .stop_with(StopOptions::graceful(ms(100)))
            .await
            .unwrap();

        let records = orchestrator.history("slow", 100).unwrap();
        let abandoned = records
            .iter()
            .find(|r| r.cause == Cause::Shutdown)
            .unwrap_or_else(|| panic!("no shutdown record: {records:?}"));
        assert!(abandoned.is_skipped());
        assert_eq!(abandoned.reason(), Some("shutdown"));
        assert_eq!(
            abandoned.payload.get("interrupted").and_then(|v| v.as_str()),
            Some("scheduled")
        );
        assert!(abandoned.started_at < stop_at);
        assert!(abandoned.finished_at >= stop_at + ms(100));
        assert!(abandoned.finished_at < at(1100));
        assert!(records.iter().all(|r| !r.is_ok()));
        assert_eq!(orchestrator.engine_state("slow").unwrap(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_history_eviction() {
        let config = OrchestratorConfig::default().with_history_capacity(5);
        let (clock, orchestrator) = manual(config);
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new("improve", ms(100), ok_action()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(700), ms(10)).await.unwrap();

        let records = orchestrator.history("e", 10).unwrap();
        assert_eq!(records.len(), 5);
        let starts: Vec<u128> = records.iter().map(|r| r.started_at.as_millis()).collect();
        assert_eq!(starts, vec![300, 400, 500, 600, 700]);

        let aggregate = orchestrator.aggregate("e").unwrap();
        assert_eq!(aggregate.count_ok, 7);
        assert_eq!(aggregate.last_ok_at, Some(at(700)));
    }

    // ==========================================================================
    // Invariants
    // ==========================================================================

    #[tokio::test]
    async fn test_history_is_append_only() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new("improve", ms(100), ScriptedAction::failing_first(2))
                    .with_pre(ok_action()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(500), ms(10)).await.unwrap();
        let early = orchestrator.history("e", 1000).unwrap();
        drive(&orchestrator, &clock, at(1500), ms(10)).await.unwrap();
        let late = orchestrator.history("e", 1000).unwrap();

        assert!(late.len() > early.len());
        assert_eq!(&late[..early.len()], &early[..]);
    }

    #[tokio::test]
    async fn test_errors_and_panics_never_escape() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        orchestrator
            .register(single(
                "bad",
                CompoundingAction::new(
                    "improve",
                    ms(100),
                    ScriptedAction::new([Step::fail("boom"), Step::panic("kaboom")]),
                ),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(110), ms(10)).await.unwrap();

        let records = orchestrator.history("bad", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Outcome::Error);
        assert_eq!(records[0].reason(), Some("boom"));
        assert_eq!(records[1].outcome, Outcome::Error);
        assert_eq!(records[1].reason(), Some("panic"));
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_error() {
        let config = OrchestratorConfig::default().with_action_timeout(ms(50));
        let (clock, orchestrator) = manual(config);
        orchestrator
            .register(single(
                "slow",
                CompoundingAction::new(
                    "improve",
                    ms(100),
                    SleepyAction::new(Arc::new(clock.clone()), ms(200)),
                ),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(200), ms(10)).await.unwrap();

        let records = orchestrator.history("slow", 10).unwrap();
        assert_eq!(records[0].outcome, Outcome::Error);
        assert_eq!(records[0].reason(), Some("timeout"));
        assert_eq!(records[0].started_at, at(100));
        assert_eq!(records[0].finished_at, at(150));
    }

    #[tokio::test]
    async fn test_pre_finishes_before_main_starts() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new("improve", ms(100), ok_action())
                    .with_pre(SleepyAction::new(Arc::new(clock.clone()), ms(5))),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(1000), ms(10)).await.unwrap();

        let records = orchestrator.history("e", 1000).unwrap();
        let mains: Vec<&ExecutionRecord> = records.iter().filter(|r| !r.is_pre()).collect();
        assert!(!mains.is_empty());
        for main in mains {
            let pre = records
                .iter()
                .filter(|r| r.is_pre() && r.started_at <= main.started_at)
                .last()
                .unwrap();
            assert!(pre.finished_at <= main.started_at);
        }
        assert_no_self_concurrency(&records);
    }

    #[tokio::test]
    async fn test_cooldown_separates_attempts_after_threshold() {
        let config = OrchestratorConfig::default()
            .with_minimum_failure_cooldown(ms(300))
            .with_failure_window(4, 2);
        let (clock, orchestrator) = manual(config);
        orchestrator
            .register(single(
                "down",
                CompoundingAction::new(
                    "improve",
                    ms(50),
                    action_fn(|_| async { anyhow::bail!("still down") }),
                ),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(2000), ms(10)).await.unwrap();

        let errors: Vec<ExecutionRecord> = orchestrator
            .history("down", 1000)
            .unwrap()
            .into_iter()
            .filter(|r| r.is_error())
            .collect();
        assert!(errors.len() >= 3);
        // From the second error on, the window holds at least `threshold` errors.
        for pair in errors[1..].windows(2) {
            assert!(pair[1].started_at - pair[0].finished_at >= ms(300));
        }
    }

    #[tokio::test]
    async fn test_success_does_not_reset_failure_window() {
        let config = OrchestratorConfig::default().with_minimum_failure_cooldown(ms(500));
        let (clock, orchestrator) = manual(config);
        let action = ScriptedAction::new([
            Step::fail("a"),
            Step::fail("b"),
            Step::Ok,
            Step::fail("c"),
        ]);
        orchestrator
            .register(single(
                "patchy",
                CompoundingAction::new("improve", ms(100), action.clone()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(1000), ms(10)).await.unwrap();

        let records = orchestrator.history("patchy", 100).unwrap();
        let timeline: Vec<(u128, Outcome)> = records
            .iter()
            .map(|r| (r.started_at.as_millis(), r.outcome))
            .collect();
        // The third error in the last ten attempts cools down despite the success between.
        assert_eq!(
            timeline,
            vec![
                (100, Outcome::Error),
                (110, Outcome::Error),
                (120, Outcome::Ok),
                (220, Outcome::Error),
                (720, Outcome::Ok),
                (820, Outcome::Ok),
                (920, Outcome::Ok),
            ]
        );
        assert_eq!(action.calls(), 7);
    }

    #[tokio::test]
    async fn test_trigger_and_self_trigger_leave_cadence_alone() {
        let (clock, orchestrator) = manual(OrchestratorConfig::default());
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new(
                    "improve",
                    ms(100),
                    action_fn(|ctx| async move {
                        if ctx.cause() == &Cause::Scheduled {
                            ctx.handle().trigger_self();
                        }
                        Ok(Payload::new())
                    }),
                )
                .with_pre(ok_action()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(100), ms(10)).await.unwrap();
        let cadence_before = orchestrator.status().engine("e").unwrap().actions.clone();

        clock.advance(ms(5));
        orchestrator.trigger(Trigger::new(MANUAL)).await.unwrap();
        orchestrator.advance().await.unwrap();

        let cadence_after = orchestrator.status().engine("e").unwrap().actions.clone();
        assert_eq!(cadence_before[0].last_main_at, cadence_after[0].last_main_at);
        assert_eq!(cadence_before[0].last_pre_at, cadence_after[0].last_pre_at);

        let causes: Vec<Cause> = orchestrator
            .history("e", 10)
            .unwrap()
            .into_iter()
            .filter(|r| !r.is_pre())
            .map(|r| r.cause)
            .collect();
        assert_eq!(
            causes,
            vec![
                Cause::Scheduled,
                Cause::Triggered(MANUAL.into()),
                Cause::Triggered("self".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_raised() {
        init_tracing();
        let clock = ManualClock::new();
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = Orchestrator::with_sink(
            Arc::new(clock.clone()),
            OrchestratorConfig::default(),
            sink.clone(),
        )
        .unwrap();
        orchestrator
            .register(single(
                "e",
                CompoundingAction::new("improve", ms(100), ok_action()),
            ))
            .unwrap();
        orchestrator.start_manual().unwrap();

        drive(&orchestrator, &clock, at(200), ms(10)).await.unwrap();
        sink.fail(true);
        drive(&orchestrator, &clock, at(400), ms(10)).await.unwrap();

        assert_eq!(sink.records().len(), 2);
        assert_eq!(orchestrator.history("e", 10).unwrap().len(), 4);
        let status = orchestrator.status();
        assert_eq!(status.sink_failures, 2);
        assert_eq!(status.internal_errors.len(), 2);
    }

    // ==========================================================================
    // Randomized schedules
    // ==========================================================================

    struct Run {
        status: String,
        history: String,
        records: Vec<(Duration, Vec<ExecutionRecord>)>,
    }

    async fn random_run(seed: u64) -> Run {
        let mut rng = fastrand::Rng::with_seed(seed);
        let config = OrchestratorConfig::default()
            .with_minimum_failure_cooldown(ms(200))
            .with_failure_window(5, 2);
        let (clock, orchestrator) = manual(config);

        let mut intervals = Vec::new();
        for e in 0..rng.usize(1..=4) {
            let mut descriptor = EngineDescriptor::new(format!("engine-{e}"))
                .with_priority(rng.i32(0..3))
                .handles(MANUAL);
            let interval = ms(rng.u64(2..=20) * 10);
            for a in 0..rng.usize(1..=2) {
                let steps: Vec<Step> = (0..30)
                    .map(|_| {
                        if rng.u8(0..4) == 0 {
                            Step::fail("flaky")
                        } else {
                            Step::Ok
                        }
                    })
                    .collect();
                let mut action = CompoundingAction::new(
                    format!("action-{a}"),
                    interval,
                    ScriptedAction::new(steps),
                );
                if rng.bool() {
                    let pre = SleepyAction::new(Arc::new(clock.clone()), ms(rng.u64(0..=30)));
                    action = action.with_pre(pre);
                    if rng.bool() {
                        action = action.chained();
                    }
                }
                descriptor = descriptor.with_action(action);
            }
            intervals.push(interval);
            orchestrator.register(descriptor).unwrap();
        }
        orchestrator.start_manual().unwrap();

        while clock.now() < at(3000) {
            orchestrator.advance().await.unwrap();
            if rng.u8(0..10) == 0 {
                orchestrator.trigger(Trigger::new(MANUAL)).await.unwrap();
            }
            clock.advance(ms(rng.u64(1..=40)));
        }

        let names = orchestrator.engine_names();
        let records: Vec<(Duration, Vec<ExecutionRecord>)> = names
            .iter()
            .zip(intervals)
            .map(|(name, interval)| (interval, orchestrator.history(name, 1000).unwrap()))
            .collect();
        let all: Vec<&ExecutionRecord> = records.iter().flat_map(|(_, r)| r).collect();
        Run {
            status: serde_json::to_string(&orchestrator.status()).unwrap(),
            history: serde_json::to_string(&all).unwrap(),
            records,
        }
    }

    #[tokio::test]
    async fn test_identical_inputs_give_identical_output() {
        for seed in [1, 7, 42] {
            let first = random_run(seed).await;
            let second = random_run(seed).await;
            assert_eq!(first.status, second.status, "status differs for seed {seed}");
            assert_eq!(first.history, second.history, "history differs for seed {seed}");
        }
    }

    #[tokio::test]
    async fn test_random_schedules_keep_invariants() {
        for seed in 0..20 {
            for (interval, records) in random_run(seed).await.records {
                assert!(records.iter().all(|r| r.started_at <= r.finished_at));
                assert_no_self_concurrency(&records);

                for (_, runs) in executed_by_action(&records) {
                    let owned: Vec<ExecutionRecord> = runs.into_iter().cloned().collect();
                    let mains: Vec<ExecutionRecord> =
                        owned.into_iter().filter(|r| !r.is_pre()).collect();
                    assert_cadence_floor(&mains, interval);
                }
            }
        }
    }
}
