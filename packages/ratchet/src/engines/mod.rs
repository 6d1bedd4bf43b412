//! Built-in engines.
//!
//! Each engine is an ordinary [`EngineDescriptor`](crate::EngineDescriptor)
//! built on one compounding action: a cheap pre that samples an injected data
//! source, and a main that consolidates what was sampled. The data sources
//! are traits, so production callers plug in real telemetry and tests plug
//! in fixed values.
//!
//! | Engine | Context | Pre | Main |
//! |---|---|---|---|
//! | [`predictive_failure`] | `failure_prevention` | sample error rate / latency | trend, time to threshold, risk |
//! | [`coordination`] | `coordination_optimization` | snapshot worker load | greedy rebalancing plan |
//! | [`subscription`] | `subscription_resolution` | drain pending requests | resolve against topic catalog |

pub mod coordination;
pub mod predictive_failure;
pub mod subscription;

pub use coordination::{
    coordination_engine, plan_rebalance, CoordinationConfig, LoadSource, RebalancePlan,
    WorkMove, WorkerLoad,
};
pub use predictive_failure::{
    forecast, predictive_failure_engine, FailureSignal, FailureSignalSource, Forecast,
    PredictiveFailureConfig, Risk, Sample,
};
pub use subscription::{
    subscription_engine, Resolution, SubscriptionConfig, SubscriptionRequest,
    SubscriptionSource, TopicCatalog, TopicPattern,
};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
