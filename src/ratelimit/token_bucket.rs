//! Token bucket admission.
//!
//! The bucket holds up to `burst_capacity` tokens and refills continuously at
//! `limit_for_period / window_seconds` tokens per second. A request passes if
//! the refilled bucket still holds `cost` tokens.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{EvaluationResult, RateLimitAlgorithm};
use super::key::CounterKey;
use crate::policy::{AlgorithmKind, RateLimitPolicy};
use crate::store::{seconds, CounterStore, StoreResult, TokenRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::TokenBucket
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
        let rate = policy.rate_per_second();
        let window = Duration::from_secs(policy.window_seconds);

        let request = TokenRequest {
            refill_per_sec: rate,
            capacity,
            cost: cost as f64,
            now,
            // Idle long enough to refill completely means the state is redundant
            ttl: seconds(capacity / rate).max(window),
        };
        let outcome = store
            .token_consume(&key.storage_key(self.kind()), &request)
            .await?;

        let tokens = outcome.tokens_remaining.max(0.0);
        let limit = policy.capacity();
        let remaining = (tokens.floor() as u64).min(limit);

        trace!(
            key = %key,
            allowed = outcome.allowed,
            tokens,
            "Token bucket evaluated"
        );

        Ok(EvaluationResult {
            allowed: outcome.allowed,
            limit,
            remaining,
            current_count: limit - remaining,
            reset_after: seconds((capacity - tokens) / rate),
            retry_after: (!outcome.allowed && cost <= limit)
                .then(|| outcome.next_token_at.saturating_sub(now)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000;

    fn at(millis: u64) -> Duration {
        Duration::from_secs(T0) + Duration::from_millis(millis)
    }

    fn key() -> CounterKey {
        CounterKey::new("test", "tb", "client", "/endpoint")
    }

    fn policy(limit: u64, window: u64, burst: u64) -> RateLimitPolicy {
        RateLimitPolicy::new("tb", AlgorithmKind::TokenBucket, limit, window).with_burst(burst)
    }

    #[tokio::test]
    async fn test_burst_then_refill_scenario() {
        let store = MemoryCounterStore::new();
        let policy = policy(10, 1, 10);

        for expected_remaining in (0..10).rev() {
            let result = TokenBucket
                .evaluate(&store, &key(), &policy, 1, at(0))
                .await
                .unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = TokenBucket
            .evaluate(&store, &key(), &policy, 1, at(0))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(100)));

        let refilled = TokenBucket
            .evaluate(&store, &key(), &policy, 1, at(100))
            .await
            .unwrap();
        assert!(refilled.allowed);
    }

    #[tokio::test]
    async fn test_burst_capacity_above_rate() {
        let store = MemoryCounterStore::new();
        // 1 request per second sustained, bursts of 5
        let policy = policy(1, 1, 5);

        for _ in 0..5 {
            assert!(
                TokenBucket
                    .evaluate(&store, &key(), &policy, 1, at(0))
                    .await
                    .unwrap()
                    .allowed
            );
        }
        let denied = TokenBucket
            .evaluate(&store, &key(), &policy, 1, at(0))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 5);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(denied.reset_after, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cost_larger_than_remaining_is_denied() {
        let store = MemoryCounterStore::new();
        let policy = policy(10, 1, 10);

        let first = TokenBucket
            .evaluate(&store, &key(), &policy, 8, at(0))
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);

        let second = TokenBucket
            .evaluate(&store, &key(), &policy, 3, at(0))
            .await
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.remaining, 2);
        assert_eq!(second.retry_after, Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_cost_above_capacity_has_no_retry() {
        let store = MemoryCounterStore::new();
        let policy = policy(10, 1, 10);

        let result = TokenBucket
            .evaluate(&store, &key(), &policy, 11, at(0))
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 10);
        assert_eq!(result.retry_after, None);
    }

    proptest! {
        /// Requests spaced further apart than one refill interval are never denied.
        #[test]
        fn prop_requests_below_rate_never_denied(
            limit in 1u64..50,
            window in 1u64..10,
            extra_burst in 0u64..5,
            gaps in prop::collection::vec(0u64..2_000_000, 1..60),
        ) {
            let policy = policy(limit, window, limit + extra_burst);
            let interval_us = (window * 1_000_000).div_ceil(limit) + 1;
            let store = MemoryCounterStore::new();

            let mut now = Duration::from_secs(T0);
            for gap in gaps {
                let result = futures::executor::block_on(
                    TokenBucket.evaluate(&store, &key(), &policy, 1, now),
                )
                .unwrap();
                prop_assert!(result.allowed, "denied at {:?}", now);
                now += Duration::from_micros(interval_us + gap);
            }
        }
    }
}
