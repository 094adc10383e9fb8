//! Decision metrics.
//!
//! The checker emits one [`MetricsEvent`] per decision. Sinks must not block
//! and cannot fail the check that produced the event.

use std::fmt;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::Result;
use crate::policy::AlgorithmKind;

/// How a check was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    /// Over quota
    Throttled,
    /// Rejected by a fail-closed fallback
    Denied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Throttled => "throttled",
            Outcome::Denied => "denied",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision bypassed normal evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradedReason {
    NoPolicy,
    StoreUnavailable,
}

impl DegradedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedReason::NoPolicy => "no_policy",
            DegradedReason::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsEvent {
    pub outcome: Outcome,
    /// Unset when no policy was resolved
    pub algorithm: Option<AlgorithmKind>,
    pub policy_id: Option<String>,
    pub latency: Duration,
    pub degraded: Option<DegradedReason>,
}

impl MetricsEvent {
    fn algorithm_label(&self) -> &'static str {
        self.algorithm.map(|a| a.as_str()).unwrap_or("none")
    }
}

/// Receives decision events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &MetricsEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: &MetricsEvent) {}
}

/// Prometheus-backed sink with its own registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    decisions: IntCounterVec,
    duration: HistogramVec,
    degraded: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new("quotaguard_decisions_total", "Rate limit decisions by outcome"),
            &["outcome", "algorithm"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "quotaguard_check_duration_seconds",
                "Time spent deciding a single check",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25,
            ]),
            &["algorithm"],
        )?;
        let degraded = IntCounterVec::new(
            Opts::new(
                "quotaguard_degraded_total",
                "Decisions answered by a failure-mode fallback",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(degraded.clone()))?;

        Ok(Self {
            registry,
            decisions,
            duration,
            degraded,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, event: &MetricsEvent) {
        let algorithm = event.algorithm_label();
        self.decisions
            .with_label_values(&[event.outcome.as_str(), algorithm])
            .inc();
        self.duration
            .with_label_values(&[algorithm])
            .observe(event.latency.as_secs_f64());
        if let Some(reason) = event.degraded {
            self.degraded.with_label_values(&[reason.as_str()]).inc();
        }
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}
