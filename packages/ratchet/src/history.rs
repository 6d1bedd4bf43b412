//! Execution history: per-engine ring buffers of [`ExecutionRecord`]s.
//!
//! The store is the source of truth for what happened. Appends are O(1);
//! queries copy the relevant slice so readers never hold a lock while they
//! work with the result.
//!
//! # Retention
//!
//! Each engine keeps at most `capacity` records. When a new record arrives
//! at a full buffer the oldest one is evicted. Aggregate counters are
//! cumulative and survive eviction and engine restarts.
//!
//! # Sink
//!
//! An optional [`HistorySink`] sees every record as it is appended. It runs on
//! the hot path. A failing sink is counted and logged; the failure is kept on
//! a bounded internal error list and never retried or raised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::clock::Timestamp;
use crate::record::{ExecutionRecord, Outcome};

/// Receives every appended record, e.g. to persist it.
pub trait HistorySink: Send + Sync + 'static {
    fn record(&self, record: &ExecutionRecord) -> anyhow::Result<()>;
}

/// Per-engine summary of everything ever appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub count_ok: u64,
    pub count_error: u64,
    pub count_skipped: u64,
    pub last_ok_at: Option<Timestamp>,
    pub last_error_at: Option<Timestamp>,
}

impl Aggregate {
    fn observe(&mut self, record: &ExecutionRecord) {
        match record.outcome {
            Outcome::Ok => {
                self.count_ok += 1;
                self.last_ok_at = Some(record.finished_at);
            }
            Outcome::Error => {
                self.count_error += 1;
                self.last_error_at = Some(record.finished_at);
            }
            Outcome::Skipped => self.count_skipped += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.count_ok + self.count_error + self.count_skipped
    }
}

/// A failure inside the orchestrator's own plumbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InternalError {
    pub at: Timestamp,
    pub engine: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct EngineLog {
    records: VecDeque<ExecutionRecord>,
    aggregate: Aggregate,
    evicted: u64,
}

/// Bounded, append-only execution history.
pub struct HistoryStore {
    capacity: usize,
    logs: DashMap<String, EngineLog>,
    sink: Option<Arc<dyn HistorySink>>,
    sink_failures: AtomicU64,
    internal_errors: Mutex<VecDeque<InternalError>>,
    internal_error_capacity: usize,
}

impl HistoryStore {
    pub fn new(capacity: usize, internal_error_capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            logs: DashMap::new(),
            sink: None,
            sink_failures: AtomicU64::new(0),
            internal_errors: Mutex::new(VecDeque::new()),
            internal_error_capacity,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `record`, evicting the engine's oldest record when full.
    pub fn append(&self, record: ExecutionRecord) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&record) {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    engine = %record.engine,
                    action = %record.action,
                    error = %e,
                    "history sink failed"
                );
                self.push_internal_error(InternalError {
                    at: record.finished_at,
                    engine: record.engine.clone(),
                    message: format!("history sink failed: {e:#}"),
                });
            }
        }

        let mut log = self.logs.entry(record.engine.clone()).or_default();
        log.aggregate.observe(&record);
        if log.records.len() == self.capacity {
            log.records.pop_front();
            log.evicted += 1;
        }
        log.records.push_back(record);
    }

    /// The last `k` records of `engine`, oldest first.
    pub fn recent(&self, engine: &str, k: usize) -> Vec<ExecutionRecord> {
        self.logs
            .get(engine)
            .map(|log| {
                let skip = log.records.len().saturating_sub(k);
                log.records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Retained records of `engine` that started at or after `since`.
    pub fn since(&self, engine: &str, since: Timestamp) -> Vec<ExecutionRecord> {
        self.logs
            .get(engine)
            .map(|log| {
                log.records
                    .iter()
                    .filter(|record| record.started_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn aggregate(&self, engine: &str) -> Aggregate {
        self.logs
            .get(engine)
            .map(|log| log.aggregate.clone())
            .unwrap_or_default()
    }

    /// Records currently retained for `engine`.
    pub fn len(&self, engine: &str) -> usize {
        self.logs.get(engine).map_or(0, |log| log.records.len())
    }

    /// Records of `engine` evicted so far.
    pub fn evicted(&self, engine: &str) -> u64 {
        self.logs.get(engine).map_or(0, |log| log.evicted)
    }

    /// Errors among the last `window` retained records of `engine`.
    pub fn recent_errors(&self, engine: &str, window: usize) -> usize {
        self.logs.get(engine).map_or(0, |log| {
            log.records
                .iter()
                .rev()
                .take(window)
                .filter(|record| record.is_error())
                .count()
        })
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    /// Recent internal errors, oldest first.
    pub fn internal_errors(&self) -> Vec<InternalError> {
        self.internal_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn push_internal_error(&self, error: InternalError) {
        if self.internal_error_capacity == 0 {
            return;
        }
        let mut errors = self
            .internal_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if errors.len() == self.internal_error_capacity {
            errors.pop_front();
        }
        errors.push_back(error);
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("capacity", &self.capacity)
            .field("engines", &self.logs.len())
            .field("has_sink", &self.sink.is_some())
            .field("sink_failures", &self.sink_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cause, Payload};

    fn record(engine: &str, at: u64, outcome: Outcome) -> ExecutionRecord {
        ExecutionRecord::new(
            engine,
            "act",
            Timestamp::from_millis(at),
            Timestamp::from_millis(at + 1),
            outcome,
            Cause::Scheduled,
            Payload::new(),
        )
    }

    struct FailingSink;

    impl HistorySink for FailingSink {
        fn record(&self, _record: &ExecutionRecord) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let store = HistoryStore::new(5, 10);
        for at in 0..7 {
            store.append(record("e", at * 10, Outcome::Ok));
        }

        let kept = store.recent("e", 10);
        assert_eq!(kept.len(), 5);
        assert_eq!(kept[0].started_at, Timestamp::from_millis(20));
        assert_eq!(kept[4].started_at, Timestamp::from_millis(60));
        assert_eq!(store.evicted("e"), 2);
    }

    #[test]
    fn recent_returns_newest_k_oldest_first() {
        let store = HistoryStore::new(10, 10);
        for at in 0..4 {
            store.append(record("e", at, Outcome::Ok));
        }
        let last_two: Vec<_> = store
            .recent("e", 2)
            .iter()
            .map(|r| r.started_at.as_millis())
            .collect();
        assert_eq!(last_two, vec![2, 3]);
    }

    #[test]
    fn since_filters_by_start() {
        let store = HistoryStore::new(10, 10);
        for at in [0, 50, 100, 150] {
            store.append(record("e", at, Outcome::Ok));
        }
        assert_eq!(store.since("e", Timestamp::from_millis(100)).len(), 2);
    }

    #[test]
    fn aggregate_survives_eviction() {
        let store = HistoryStore::new(2, 10);
        store.append(record("e", 0, Outcome::Ok));
        store.append(record("e", 10, Outcome::Error));
        store.append(record("e", 20, Outcome::Skipped));
        store.append(record("e", 30, Outcome::Ok));

        let aggregate = store.aggregate("e");
        assert_eq!(aggregate.count_ok, 2);
        assert_eq!(aggregate.count_error, 1);
        assert_eq!(aggregate.count_skipped, 1);
        assert_eq!(aggregate.last_ok_at, Some(Timestamp::from_millis(31)));
        assert_eq!(aggregate.last_error_at, Some(Timestamp::from_millis(11)));
        assert_eq!(store.len("e"), 2);
    }

    #[test]
    fn unknown_engine_has_empty_history() {
        let store = HistoryStore::new(2, 10);
        assert!(store.recent("ghost", 5).is_empty());
        assert_eq!(store.aggregate("ghost"), Aggregate::default());
    }

    #[test]
    fn sink_failures_are_counted_not_raised() {
        let store = HistoryStore::new(10, 1).with_sink(Arc::new(FailingSink));
        store.append(record("e", 0, Outcome::Ok));
        store.append(record("e", 10, Outcome::Ok));

        assert_eq!(store.len("e"), 2);
        assert_eq!(store.sink_failures(), 2);

        let errors = store.internal_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].at, Timestamp::from_millis(11));
        assert!(errors[0].message.contains("disk full"));
    }

    #[test]
    fn recent_errors_counts_the_window() {
        let store = HistoryStore::new(10, 10);
        store.append(record("e", 0, Outcome::Error));
        store.append(record("e", 10, Outcome::Error));
        store.append(record("e", 20, Outcome::Ok));
        assert_eq!(store.recent_errors("e", 2), 1);
        assert_eq!(store.recent_errors("e", 3), 2);
    }
}
