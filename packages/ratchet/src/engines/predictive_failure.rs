//! Predictive failure engine.
//!
//! The pre samples a [`FailureSignalSource`] into a bounded window. The main
//! smooths the error rate (EWMA), fits a least-squares trend over the window,
//! projects when the rate will cross the configured threshold, and classifies
//! the risk.
//!
//! ```text
//! risk = critical  if ewma ≥ threshold or time_to_threshold ≤ critical_horizon
//!        elevated  if time_to_threshold ≤ warning_horizon, ewma ≥ threshold / 2,
//!                  or latency ewma ≥ latency threshold
//!        low       otherwise
//! ```
//!
//! A `failure_prevention` trigger may carry a fresh sample as
//! `{"error_rate": f64, "latency_ms": f64}`; it is added to the window before
//! the forecast runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lock;
use crate::action::{Action, ActionContext, CompoundingAction};
use crate::clock::Timestamp;
use crate::engine::EngineDescriptor;
use crate::record::Payload;
use crate::trigger::FAILURE_PREVENTION;

/// Action name of the forecast.
pub const FORECAST_ACTION: &str = "forecast";

/// One observation from the monitored system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureSignal {
    /// Fraction of failed requests, `0.0..=1.0`.
    pub error_rate: f64,
    pub latency_ms: f64,
}

/// Where failure signals come from.
#[async_trait]
pub trait FailureSignalSource: Send + Sync + 'static {
    async fn sample(&self) -> Result<FailureSignal>;
}

#[derive(Debug, Clone)]
pub struct PredictiveFailureConfig {
    pub main_interval: Duration,
    pub pre_fraction: Option<f64>,
    /// Samples kept for the trend.
    pub window: usize,
    /// EWMA weight of the newest sample.
    pub smoothing: f64,
    pub error_rate_threshold: f64,
    pub latency_threshold_ms: f64,
    pub warning_horizon: Duration,
    pub critical_horizon: Duration,
    /// Samples needed before a trend is fitted.
    pub min_trend_samples: usize,
}

impl Default for PredictiveFailureConfig {
    fn default() -> Self {
        Self {
            main_interval: Duration::from_secs(60),
            pre_fraction: None,
            window: 32,
            smoothing: 0.3,
            error_rate_threshold: 0.05,
            latency_threshold_ms: 1000.0,
            warning_horizon: Duration::from_secs(600),
            critical_horizon: Duration::from_secs(120),
            min_trend_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Elevated,
    Critical,
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Risk::Low => write!(f, "low"),
            Risk::Elevated => write!(f, "elevated"),
            Risk::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: Timestamp,
    pub signal: FailureSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub samples: usize,
    pub error_rate_ewma: f64,
    pub latency_ewma_ms: f64,
    /// Error-rate change per second from the least-squares fit.
    pub trend_per_sec: f64,
    pub time_to_threshold_secs: Option<f64>,
    pub risk: Risk,
    pub recommendations: Vec<String>,
}

fn ewma(values: impl Iterator<Item = f64>, alpha: f64) -> f64 {
    let mut smoothed: Option<f64> = None;
    for value in values {
        smoothed = Some(match smoothed {
            Some(previous) => alpha * value + (1.0 - alpha) * previous,
            None => value,
        });
    }
    smoothed.unwrap_or(0.0)
}

/// Slope of the least-squares line through `(x, y)` points.
fn slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (covariance, variance) = points.iter().fold((0.0, 0.0), |(cov, var), (x, y)| {
        let dx = x - mean_x;
        (cov + dx * (y - mean_y), var + dx * dx)
    });
    if variance == 0.0 {
        0.0
    } else {
        covariance / variance
    }
}

/// Forecast from `samples` (oldest first).
pub fn forecast(samples: &[Sample], config: &PredictiveFailureConfig) -> Forecast {
    let error_rate_ewma = ewma(samples.iter().map(|s| s.signal.error_rate), config.smoothing);
    let latency_ewma_ms = ewma(samples.iter().map(|s| s.signal.latency_ms), config.smoothing);

    let trend_per_sec = match samples.first() {
        Some(first) if samples.len() >= config.min_trend_samples => {
            let points: Vec<(f64, f64)> = samples
                .iter()
                .map(|s| ((s.at - first.at).as_secs_f64(), s.signal.error_rate))
                .collect();
            slope(&points)
        }
        _ => 0.0,
    };

    let threshold = config.error_rate_threshold;
    let time_to_threshold_secs = if error_rate_ewma >= threshold {
        Some(0.0)
    } else if trend_per_sec > 0.0 {
        Some((threshold - error_rate_ewma) / trend_per_sec)
    } else {
        None
    };

    let within = |horizon: Duration| {
        time_to_threshold_secs.is_some_and(|secs| secs <= horizon.as_secs_f64())
    };
    let latency_high = latency_ewma_ms >= config.latency_threshold_ms;
    let risk = if error_rate_ewma >= threshold || within(config.critical_horizon) {
        Risk::Critical
    } else if within(config.warning_horizon) || error_rate_ewma >= threshold / 2.0 || latency_high
    {
        Risk::Elevated
    } else {
        Risk::Low
    };

    let mut recommendations = Vec::new();
    if error_rate_ewma >= threshold {
        recommendations.push("error rate above threshold: roll back recent changes".to_string());
    } else if let Some(secs) = time_to_threshold_secs.filter(|_| risk != Risk::Low) {
        recommendations.push(format!(
            "error rate projected to cross {threshold} in {secs:.0}s: prepare a rollback"
        ));
    }
    if trend_per_sec > 0.0 && risk != Risk::Low {
        recommendations.push("error rate trending upward: review recent deploys".to_string());
    }
    if latency_high {
        recommendations
            .push("latency above threshold: check downstream saturation".to_string());
    }

    Forecast {
        samples: samples.len(),
        error_rate_ewma,
        latency_ewma_ms,
        trend_per_sec,
        time_to_threshold_secs,
        risk,
        recommendations,
    }
}

struct Predictor {
    source: Arc<dyn FailureSignalSource>,
    config: PredictiveFailureConfig,
    samples: Mutex<VecDeque<Sample>>,
}

impl Predictor {
    fn push(&self, sample: Sample) -> usize {
        let mut samples = lock(&self.samples);
        if samples.len() == self.config.window.max(1) {
            samples.pop_front();
        }
        samples.push_back(sample);
        samples.len()
    }
}

fn signal_from_payload(payload: &Payload) -> Option<FailureSignal> {
    let error_rate = payload.get("error_rate").and_then(Value::as_f64)?;
    let latency_ms = payload
        .get("latency_ms")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    Some(FailureSignal {
        error_rate,
        latency_ms,
    })
}

struct SampleSignals(Arc<Predictor>);

#[async_trait]
impl Action for SampleSignals {
    async fn run(&self, ctx: ActionContext) -> Result<Payload> {
        let signal = self.0.source.sample().await?;
        let retained = self.0.push(Sample {
            at: ctx.now(),
            signal,
        });

        let mut payload = Payload::new();
        payload.insert("error_rate".into(), signal.error_rate.into());
        payload.insert("latency_ms".into(), signal.latency_ms.into());
        payload.insert("retained".into(), retained.into());
        Ok(payload)
    }
}

struct ForecastFailures(Arc<Predictor>);

#[async_trait]
impl Action for ForecastFailures {
    async fn run(&self, ctx: ActionContext) -> Result<Payload> {
        if let Some(signal) = signal_from_payload(ctx.trigger_payload()) {
            self.0.push(Sample {
                at: ctx.now(),
                signal,
            });
        }

        let samples: Vec<Sample> = lock(&self.0.samples).iter().copied().collect();
        if samples.is_empty() {
            bail!("no failure signals sampled yet");
        }

        let forecast = forecast(&samples, &self.0.config);
        match serde_json::to_value(&forecast)? {
            Value::Object(payload) => Ok(payload),
            other => bail!("forecast serialized to {other}"),
        }
    }
}

/// An engine forecasting failures from `source`, handling
/// `failure_prevention` triggers.
pub fn predictive_failure_engine(
    name: impl Into<String>,
    source: impl FailureSignalSource,
    config: PredictiveFailureConfig,
) -> EngineDescriptor {
    let main_interval = config.main_interval;
    let pre_fraction = config.pre_fraction;
    let predictor = Arc::new(Predictor {
        source: Arc::new(source),
        config,
        samples: Mutex::new(VecDeque::new()),
    });

    let mut action = CompoundingAction::new(
        FORECAST_ACTION,
        main_interval,
        ForecastFailures(predictor.clone()),
    )
    .with_pre(SampleSignals(predictor));
    if let Some(fraction) = pre_fraction {
        action = action.with_pre_fraction(fraction);
    }

    EngineDescriptor::new(name)
        .handles(FAILURE_PREVENTION)
        .with_metadata("kind", "predictive_failure")
        .with_action(action)
}
