//! Atomic, TTL-capable counter storage.
//!
//! Every primitive here is linearizable per key: the read, the decision and
//! the write happen as one step inside the backend, so racing callers on
//! different instances never lose updates. Timestamps are carried as integer
//! microseconds since the Unix epoch; the Redis scripts perform the same
//! arithmetic as the functions in this module.

mod memory;
mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreConfig};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Atomic counter primitives the admission algorithms are built from.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Add `amount` to the counter at `key` unless the sum would pass
    /// `limit`, arming `ttl` when the key is created. A rejected amount leaves
    /// the counter untouched.
    async fn increment_with_expiry(
        &self,
        key: &str,
        request: &CounterRequest,
    ) -> StoreResult<CounterOutcome>;

    /// Refill a token bucket for the elapsed time and try to take `cost` tokens.
    async fn token_consume(&self, key: &str, request: &TokenRequest) -> StoreResult<TokenOutcome>;

    /// Roll the current/previous window pair forward to `now` and admit `cost`
    /// if the weighted count leaves room.
    async fn window_shift(&self, key: &str, request: &WindowRequest)
        -> StoreResult<WindowOutcome>;

    /// Drain a leaky bucket queue for the elapsed time and try to enqueue `cost`.
    async fn leak_enqueue(&self, key: &str, request: &LeakRequest) -> StoreResult<LeakOutcome>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct CounterRequest {
    pub amount: u64,
    pub limit: u64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    /// Admitted total after this call
    pub count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenRequest {
    pub refill_per_sec: f64,
    pub capacity: f64,
    pub cost: f64,
    pub now: Duration,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// When `cost` tokens will next be available.
    pub next_token_at: Duration,
}

impl TokenOutcome {
    pub(crate) fn new(allowed: bool, tokens_remaining: f64, request: &TokenRequest) -> Self {
        let missing = (request.cost - tokens_remaining).max(0.0);
        Self {
            allowed,
            tokens_remaining,
            next_token_at: request
                .now
                .saturating_add(seconds(missing / request.refill_per_sec)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowRequest {
    pub window: Duration,
    pub limit: u64,
    pub cost: u64,
    pub now: Duration,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub current_count: u64,
    pub previous_count: u64,
    pub window_start: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LeakRequest {
    pub drain_per_sec: f64,
    pub capacity: f64,
    pub cost: f64,
    pub now: Duration,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakOutcome {
    pub allowed: bool,
    pub queue_depth: f64,
}

#[inline]
pub(crate) fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

/// Seconds to a `Duration`, saturating on infinities and NaN.
pub(crate) fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Token bucket state: tokens and the instant they were last refilled.
pub(crate) fn refill_tokens(
    state: Option<(f64, u64)>,
    now_us: u64,
    rate: f64,
    capacity: f64,
) -> (f64, u64) {
    match state {
        None => (capacity, now_us),
        // A clock behind the stored instant refills nothing.
        Some((tokens, last_us)) if now_us <= last_us => (tokens.min(capacity), last_us),
        Some((tokens, last_us)) => {
            let elapsed = (now_us - last_us) as f64;
            ((tokens + elapsed * rate / MICROS_PER_SEC).min(capacity), now_us)
        }
    }
}

/// Leaky bucket state: queue depth and the instant it last drained.
pub(crate) fn drain_queue(state: Option<(f64, u64)>, now_us: u64, rate: f64) -> (f64, u64) {
    match state {
        None => (0.0, now_us),
        Some((depth, last_us)) if now_us <= last_us => (depth.max(0.0), last_us),
        Some((depth, last_us)) => {
            let elapsed = (now_us - last_us) as f64;
            ((depth - elapsed * rate / MICROS_PER_SEC).max(0.0), now_us)
        }
    }
}

/// Sliding window counters for the fixed window with index `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowCounts {
    pub current: u64,
    pub previous: u64,
    pub index: u64,
}

impl WindowCounts {
    /// Roll stored counts forward to window `index`.
    pub(crate) fn shift(state: Option<WindowCounts>, index: u64) -> WindowCounts {
        match state {
            // Never roll backwards on a lagging clock
            Some(s) if s.index >= index => s,
            Some(s) if s.index + 1 == index => WindowCounts {
                current: 0,
                previous: s.current,
                index,
            },
            _ => WindowCounts {
                current: 0,
                previous: 0,
                index,
            },
        }
    }

    /// `current + previous * (1 - elapsed fraction of the current window)`.
    pub(crate) fn weighted(&self, now_us: u64, window_us: u64) -> f64 {
        let start_us = self.index * window_us;
        let elapsed = now_us.saturating_sub(start_us).min(window_us) as f64;
        let fraction = elapsed / window_us as f64;
        self.current as f64 + self.previous as f64 * (1.0 - fraction)
    }
}
