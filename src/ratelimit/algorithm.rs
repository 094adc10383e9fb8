//! The admission algorithm interface.

use std::time::Duration;

use async_trait::async_trait;

use super::fixed_window::FixedWindow;
use super::key::CounterKey;
use super::leaky_bucket::LeakyBucket;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::policy::{AlgorithmKind, RateLimitPolicy};
use crate::store::{CounterStore, StoreResult};

/// The verdict of one algorithm evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub allowed: bool,
    /// The quota the remaining count is measured against
    pub limit: u64,
    pub remaining: u64,
    /// Usage counted against the limit after this evaluation
    pub current_count: u64,
    /// Time until the quota is fully restored
    pub reset_after: Duration,
    /// Set when denied: time until a request of the same cost could pass.
    /// Unset when `cost` exceeds `limit`, since such a request never fits.
    pub retry_after: Option<Duration>,
}

/// An admission algorithm built on [`CounterStore`] primitives.
///
/// Implementations never read the clock: `now` is supplied by the caller.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    async fn evaluate(
        &self,
        store: &dyn CounterStore,
        key: &CounterKey,
        policy: &RateLimitPolicy,
        cost: u64,
        now: Duration,
    ) -> StoreResult<EvaluationResult>;
}

/// The strategy implementing `kind`.
pub fn strategy_for(kind: AlgorithmKind) -> &'static dyn RateLimitAlgorithm {
    match kind {
        AlgorithmKind::TokenBucket => &TokenBucket,
        AlgorithmKind::FixedWindow => &FixedWindow,
        AlgorithmKind::SlidingWindow => &SlidingWindow,
        AlgorithmKind::LeakyBucket => &LeakyBucket,
    }
}
