//! The rate limit decision path.
//!
//! A check resolves the authoritative policy, evaluates its algorithm against
//! the shared counter store under the profile's timeout, and shapes the
//! verdict into a [`CheckResponse`]. When no policy applies or the store
//! cannot answer, the configured [`FailureMode`] decides.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::algorithm::{strategy_for, EvaluationResult};
use super::key::CounterKey;
use super::response::{ceil_secs, retry_secs, CheckRequest, CheckResponse, WarningLevel};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, FailureMode};
use crate::error::{Result, StoreError};
use crate::metrics::{DegradedReason, MetricsEvent, MetricsSink, NoopMetrics, Outcome};
use crate::policy::{PolicyCache, RateLimitPolicy};
use crate::store::CounterStore;

const REASON_EXCEEDED: &str = "rate_limit_exceeded";
const REASON_COST_EXCEEDS_LIMIT: &str = "cost_exceeds_limit";
const REASON_NO_POLICY: &str = "no_policy";
const REASON_STORE_UNAVAILABLE: &str = "store_unavailable";

/// Decides whether requests may proceed.
///
/// Cheap to share behind an `Arc`; every check is independent and holds no
/// lock across the store round trip.
pub struct RateLimitChecker {
    config: EngineConfig,
    policies: Arc<PolicyCache>,
    store: Arc<dyn CounterStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

/// Per-check values every response needs.
struct CheckContext<'a> {
    request: &'a CheckRequest,
    request_id: String,
    now: Duration,
    started: Instant,
}

impl RateLimitChecker {
    pub fn new(
        config: EngineConfig,
        policies: Arc<PolicyCache>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            config,
            policies,
            store,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    /// Decide one request.
    ///
    /// Returns `Err` only for malformed requests or when no policy snapshot
    /// could ever be loaded; store trouble and missing policies are answered
    /// according to the failure policy.
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        let started = Instant::now();
        request.validate()?;

        let ctx = CheckContext {
            request,
            request_id: request
                .request_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            now: self.clock.now(),
            started,
        };

        let Some(policy) = self.policies.resolve(&request.resolution_key()).await? else {
            return Ok(self.no_policy(&ctx));
        };

        let profile = self.config.profile(policy.profile.as_deref());
        let key = CounterKey::new(
            &self.config.store.key_prefix,
            &policy.id,
            &request.client_id,
            &request.endpoint,
        );
        let strategy = strategy_for(policy.algorithm);

        let evaluation = tokio::time::timeout(
            profile.store_timeout,
            strategy.evaluate(self.store.as_ref(), &key, &policy, request.cost, ctx.now),
        )
        .await
        .unwrap_or_else(|_| Err(StoreError::Timeout(profile.store_timeout)));

        match evaluation {
            Ok(result) => Ok(self.evaluated(&ctx, &policy, result)),
            Err(error) => {
                Ok(self.store_unavailable(&ctx, &policy, profile.on_store_unavailable, error))
            }
        }
    }

    fn evaluated(
        &self,
        ctx: &CheckContext<'_>,
        policy: &RateLimitPolicy,
        result: EvaluationResult,
    ) -> CheckResponse {
        let outcome = if result.allowed {
            Outcome::Allowed
        } else {
            Outcome::Throttled
        };
        debug!(
            request_id = %ctx.request_id,
            client_id = %ctx.request.client_id,
            endpoint = %ctx.request.endpoint,
            policy_id = %policy.id,
            algorithm = %policy.algorithm,
            outcome = %outcome,
            remaining = result.remaining,
            "Rate limit decision"
        );

        let response = CheckResponse {
            allowed: result.allowed,
            remaining: result.remaining,
            limit: result.limit,
            reset_time_seconds: ceil_secs(result.reset_after),
            reset_timestamp: rfc3339(ctx.now + result.reset_after),
            algorithm: Some(policy.algorithm),
            current_count: result.current_count,
            reason: (!result.allowed).then(|| denial_reason(ctx.request.cost, result.limit)),
            policy_id: Some(policy.id.clone()),
            response_time_ms: elapsed_ms(ctx.started),
            throttled: !result.allowed,
            retry_after_seconds: result
                .retry_after
                .filter(|_| !result.allowed)
                .map(retry_secs),
            warning_level: self.config.warning.level(result.remaining, result.limit),
            checked_at: rfc3339(ctx.now),
            request_id: Some(ctx.request_id.clone()),
            tenant_id: ctx.request.tenant_id.clone(),
        };
        self.record(ctx, outcome, Some(policy), None);
        response
    }

    fn no_policy(&self, ctx: &CheckContext<'_>) -> CheckResponse {
        let mode = self.config.failure.on_no_policy;
        warn!(
            request_id = %ctx.request_id,
            client_id = %ctx.request.client_id,
            endpoint = %ctx.request.endpoint,
            mode = ?mode,
            "No rate limit policy applies"
        );

        let response = self.fallback(ctx, None, mode, REASON_NO_POLICY);
        self.record(ctx, fallback_outcome(mode), None, Some(DegradedReason::NoPolicy));
        response
    }

    fn store_unavailable(
        &self,
        ctx: &CheckContext<'_>,
        policy: &RateLimitPolicy,
        mode: FailureMode,
        error: StoreError,
    ) -> CheckResponse {
        warn!(
            request_id = %ctx.request_id,
            policy_id = %policy.id,
            backend = self.store.backend(),
            error = %error,
            mode = ?mode,
            "Counter store unavailable, applying failure mode"
        );

        let response = self.fallback(ctx, Some(policy), mode, REASON_STORE_UNAVAILABLE);
        self.record(
            ctx,
            fallback_outcome(mode),
            Some(policy),
            Some(DegradedReason::StoreUnavailable),
        );
        response
    }

    /// A response not backed by counter state.
    ///
    /// Fail-open reports the full quota as available; fail-closed reports it
    /// as exhausted and asks the client to retry after a second.
    fn fallback(
        &self,
        ctx: &CheckContext<'_>,
        policy: Option<&RateLimitPolicy>,
        mode: FailureMode,
        reason: &str,
    ) -> CheckResponse {
        let allowed = mode.allows();
        let limit = policy.map(|p| p.limit_for_period).unwrap_or(0);
        let remaining = if allowed { limit } else { 0 };

        CheckResponse {
            allowed,
            remaining,
            limit,
            reset_time_seconds: 0,
            reset_timestamp: rfc3339(ctx.now),
            algorithm: policy.map(|p| p.algorithm),
            current_count: 0,
            reason: Some(reason.to_string()),
            policy_id: policy.map(|p| p.id.clone()),
            response_time_ms: elapsed_ms(ctx.started),
            throttled: false,
            retry_after_seconds: (!allowed).then_some(1),
            warning_level: if allowed {
                WarningLevel::Low
            } else {
                WarningLevel::Critical
            },
            checked_at: rfc3339(ctx.now),
            request_id: Some(ctx.request_id.clone()),
            tenant_id: ctx.request.tenant_id.clone(),
        }
    }

    fn record(
        &self,
        ctx: &CheckContext<'_>,
        outcome: Outcome,
        policy: Option<&RateLimitPolicy>,
        degraded: Option<DegradedReason>,
    ) {
        self.metrics.record(&MetricsEvent {
            outcome,
            algorithm: policy.map(|p| p.algorithm),
            policy_id: policy.map(|p| p.id.clone()),
            latency: ctx.started.elapsed(),
            degraded,
        });
    }
}

impl std::fmt::Debug for RateLimitChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitChecker")
            .field("backend", &self.store.backend())
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

fn fallback_outcome(mode: FailureMode) -> Outcome {
    if mode.allows() {
        Outcome::Allowed
    } else {
        Outcome::Denied
    }
}

fn denial_reason(cost: u64, limit: u64) -> String {
    if cost > limit {
        REASON_COST_EXCEEDS_LIMIT.to_string()
    } else {
        REASON_EXCEEDED.to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn rfc3339(since_epoch: Duration) -> String {
    DateTime::<Utc>::from_timestamp(since_epoch.as_secs() as i64, since_epoch.subsec_nanos())
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
