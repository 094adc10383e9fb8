//! Sliding window admission, weighted dual-counter approximation.
//!
//! The previous window's count is weighted by how much of it still overlaps a
//! window of `window_seconds` ending now:
//!
//! ```text
//! estimated = current + previous * (1 - elapsed / window)
//! ```
//!
//! A request passes if `estimated + cost <= limit`, which removes the
//! boundary burst a fixed window allows.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::{EvaluationResult, RateLimitAlgorithm};
use super::key::CounterKey;
use crate::policy::{AlgorithmKind, RateLimitPolicy};
use crate::store::{micros, seconds, CounterStore, StoreResult, WindowCounts, WindowRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

#[async_trait]
impl RateLimitAlgorithm for SlidingWindow {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SlidingWindow
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
        let limit = policy.limit_for_period;

        let request = WindowRequest {
            window,
            limit,
            cost,
            now,
            // The previous window must survive the whole current one
            ttl: window * 2,
        };
        let outcome = store
            .window_shift(&key.storage_key(self.kind()), &request)
            .await?;

        let window_us = micros(window);
        let now_us = micros(now);
        let counts = WindowCounts {
            current: outcome.current_count,
            previous: outcome.previous_count,
            index: micros(outcome.window_start) / window_us,
        };
        let estimated = counts.weighted(now_us, window_us);
        let window_end = outcome.window_start + window;

        trace!(
            key = %key,
            allowed = outcome.allowed,
            current = counts.current,
            previous = counts.previous,
            estimated,
            "Sliding window evaluated"
        );

        let retry_after = if outcome.allowed || cost > limit {
            None
        } else {
            Some(decay_wait(
                &counts,
                limit,
                cost,
                now_us,
                window_us,
                window_end.saturating_sub(now),
            ))
        };

        Ok(EvaluationResult {
            allowed: outcome.allowed,
            limit,
            remaining: (limit as f64 - estimated).max(0.0).floor() as u64,
            current_count: estimated.ceil() as u64,
            reset_after: window_end.saturating_sub(now),
            retry_after,
        })
    }
}

/// Time until the decaying previous-window weight leaves room for `cost`.
///
/// When the current window alone has no room, the answer is the next
/// boundary.
fn decay_wait(
    counts: &WindowCounts,
    limit: u64,
    cost: u64,
    now_us: u64,
    window_us: u64,
    until_boundary: Duration,
) -> Duration {
    let room = limit as f64 - cost as f64 - counts.current as f64;
    if room < 0.0 || counts.previous == 0 {
        return until_boundary;
    }

    let elapsed = now_us.saturating_sub(counts.index * window_us) as f64 / window_us as f64;
    let needed = 1.0 - room / counts.previous as f64;
    let wait = seconds((needed - elapsed) * window_us as f64 / 1_000_000.0);
    wait.min(until_boundary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::FixedWindow;
    use crate::store::MemoryCounterStore;

    const T0: u64 = 1_700_000_000;

    fn at(millis: u64) -> Duration {
        Duration::from_secs(T0) + Duration::from_millis(millis)
    }

    fn key() -> CounterKey {
        CounterKey::new("test", "sw", "client", "/endpoint")
    }

    fn policy(limit: u64, window: u64) -> RateLimitPolicy {
        RateLimitPolicy::new("sw", AlgorithmKind::SlidingWindow, limit, window)
    }

    #[tokio::test]
    async fn test_exact_cap_within_first_window() {
        let store = MemoryCounterStore::new();
        let policy = policy(5, 1);

        for expected_remaining in (0..5).rev() {
            let result = SlidingWindow
                .evaluate(&store, &key(), &policy, 1, at(100))
                .await
                .unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = SlidingWindow
            .evaluate(&store, &key(), &policy, 1, at(200))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current_count, 5);
        // Nothing in the previous window, so only the boundary frees room
        assert_eq!(denied.retry_after, Some(Duration::from_millis(800)));
    }

    #[tokio::test]
    async fn test_cost_above_limit_has_no_retry() {
        let store = MemoryCounterStore::new();
        let policy = policy(5, 1);

        let denied = SlidingWindow
            .evaluate(&store, &key(), &policy, 6, at(100))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 5);
        assert_eq!(denied.retry_after, None);
    }

    #[tokio::test]
    async fn test_boundary_burst_is_rejected() {
        let sliding_store = MemoryCounterStore::new();
        let fixed_store = MemoryCounterStore::new();
        let sliding = policy(10, 1);
        let fixed = RateLimitPolicy::new("fw", AlgorithmKind::FixedWindow, 10, 1);

        // Fill the quota at the tail end of one window
        for i in 0..10 {
            let now = at(900 + i * 10);
            assert!(SlidingWindow
                .evaluate(&sliding_store, &key(), &sliding, 1, now)
                .await
                .unwrap()
                .allowed);
            assert!(FixedWindow
                .evaluate(&fixed_store, &key(), &fixed, 1, now)
                .await
                .unwrap()
                .allowed);
        }

        // Immediately after the boundary the fixed window opens up again,
        // the sliding window does not
        let mut sliding_admitted = 0;
        let mut fixed_admitted = 0;
        for i in 0..10 {
            let now = at(1000 + i * 10 + 5);
            if SlidingWindow
                .evaluate(&sliding_store, &key(), &sliding, 1, now)
                .await
                .unwrap()
                .allowed
            {
                sliding_admitted += 1;
            }
            if FixedWindow
                .evaluate(&fixed_store, &key(), &fixed, 1, now)
                .await
                .unwrap()
                .allowed
            {
                fixed_admitted += 1;
            }
        }

        assert_eq!(fixed_admitted, 10);
        assert_eq!(sliding_admitted, 0);
    }

    #[tokio::test]
    async fn test_previous_window_decays() {
        let store = MemoryCounterStore::new();
        let policy = policy(10, 1);

        for _ in 0..10 {
            SlidingWindow
                .evaluate(&store, &key(), &policy, 1, at(0))
                .await
                .unwrap();
        }

        // Half way into the next window: 10 * 0.5 = 5 counted, room for 5
        let mut admitted = 0;
        for _ in 0..8 {
            if SlidingWindow
                .evaluate(&store, &key(), &policy, 1, at(1500))
                .await
                .unwrap()
                .allowed
            {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_retry_after_tracks_decay() {
        let store = MemoryCounterStore::new();
        let policy = policy(10, 1);

        for _ in 0..10 {
            SlidingWindow
                .evaluate(&store, &key(), &policy, 1, at(0))
                .await
                .unwrap();
        }

        // At 1.05s: estimated 9.5, one more needs previous weight <= 9,
        // reached at 1.1s
        let denied = SlidingWindow
            .evaluate(&store, &key(), &policy, 1, at(1050))
            .await
            .unwrap();
        assert!(!denied.allowed);
        let retry = denied.retry_after.unwrap();
        assert!(
            retry >= Duration::from_millis(49) && retry <= Duration::from_millis(51),
            "retry after {:?}",
            retry
        );
    }

    #[tokio::test]
    async fn test_no_sliding_window_exceeds_limit_under_steady_overload() {
        let store = MemoryCounterStore::new();
        let limit = 10;
        let policy = policy(limit, 1);

        // Offer four times the allowed rate for five windows
        let mut admitted = Vec::new();
        for i in 0..200u64 {
            let now = at(i * 25 + 3);
            if SlidingWindow
                .evaluate(&store, &key(), &policy, 1, now)
                .await
                .unwrap()
                .allowed
            {
                admitted.push(now);
            }
        }
        assert!(admitted.len() >= 40, "admitted only {}", admitted.len());

        // The busiest window always starts at an admitted request
        let window = Duration::from_secs(1);
        for start in &admitted {
            let in_window = admitted
                .iter()
                .filter(|t| **t >= *start && **t < *start + window)
                .count() as u64;
            assert!(
                in_window <= limit + 1,
                "{} admitted in the window starting at {:?}",
                in_window,
                start
            );
        }
    }
}
