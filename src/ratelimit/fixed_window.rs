//! Fixed window admission.
//!
//! Time is cut into epoch-aligned windows of `window_seconds`; each window has
//! its own counter that expires with it. Only admitted cost is counted. Up to
//! twice the limit can pass across a boundary, which is how a fixed window is
//! defined to behave.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{EvaluationResult, RateLimitAlgorithm};
use super::key::CounterKey;
use crate::policy::{AlgorithmKind, RateLimitPolicy};
use crate::store::{micros, CounterRequest, CounterStore, StoreResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FixedWindow
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        key: &CounterKey,
        policy: &RateLimitPolicy,
        cost: u64,
        now: Duration,
    ) -> StoreResult<EvaluationResult> {
        let window = Duration::from_secs(policy.window_seconds);
        let window_us = micros(window);
        let index = micros(now) / window_us;
        let window_end = Duration::from_micros((index + 1) * window_us);

        let limit = policy.limit_for_period;
        let request = CounterRequest {
            amount: cost,
            limit,
            ttl: window,
        };
        let outcome = store
            .increment_with_expiry(&key.window_key(self.kind(), index), &request)
            .await?;

        let count = outcome.count;
        let reset_after = window_end.saturating_sub(now);

        trace!(
            key = %key,
            window = index,
            allowed = outcome.allowed,
            count,
            limit,
            "Fixed window evaluated"
        );

        Ok(EvaluationResult {
            allowed: outcome.allowed,
            limit,
            remaining: limit.saturating_sub(count),
            current_count: count,
            reset_after,
            // A cost above the limit never fits, however long the caller waits
            retry_after: (!outcome.allowed && cost <= limit).then_some(reset_after),
        })
    }
}
