//! Leaky bucket admission.
//!
//! Admitted requests join a queue of `burst_capacity` slots that drains at
//! `limit_for_period / window_seconds` per second. A request that would
//! overflow the queue is rejected.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{EvaluationResult, RateLimitAlgorithm};
use super::key::CounterKey;
use crate::policy::{AlgorithmKind, RateLimitPolicy};
use crate::store::{seconds, CounterStore, LeakRequest, StoreResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket;

#[async_trait]
impl RateLimitAlgorithm for LeakyBucket {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::LeakyBucket
    }

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        key: &CounterKey,
        policy: &RateLimitPolicy,
        cost: u64,
        now: Duration,
    ) -> StoreResult<EvaluationResult> {
        let capacity = policy.capacity() as f64;
        let drain = policy.rate_per_second();
        let window = Duration::from_secs(policy.window_seconds);

        let request = LeakRequest {
            drain_per_sec: drain,
            capacity,
            cost: cost as f64,
            now,
            ttl: seconds(capacity / drain).max(window),
        };
        let outcome = store
            .leak_enqueue(&key.storage_key(self.kind()), &request)
            .await?;

        let depth = outcome.queue_depth.max(0.0);
        let limit = policy.capacity();

        trace!(key = %key, allowed = outcome.allowed, depth, "Leaky bucket evaluated");

        let retry_after = (!outcome.allowed && cost <= limit)
            .then(|| seconds((depth + cost as f64 - capacity) / drain));

        Ok(EvaluationResult {
            allowed: outcome.allowed,
            limit,
            remaining: ((capacity - depth).max(0.0).floor() as u64).min(limit),
            current_count: (depth.ceil() as u64).min(limit),
            reset_after: seconds(depth / drain),
            retry_after,
        })
    }
}
