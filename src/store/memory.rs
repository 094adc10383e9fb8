//! In-process counter store.
//!
//! A single mutex guards the whole map. Each primitive runs entirely under
//! the lock and never awaits, which makes it linearizable per key. Suited to
//! tests and single-instance deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    drain_queue, micros, refill_tokens, CounterOutcome, CounterRequest, CounterStore,
    LeakOutcome, LeakRequest, StoreResult, TokenOutcome, TokenRequest, WindowCounts,
    WindowOutcome, WindowRequest,
};
use crate::error::StoreError;

/// Expired slots are swept out of the map once every this many updates.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Counter(u64),
    Tokens { tokens: f64, last_refill_us: u64 },
    Window(WindowCounts),
    Queue { depth: f64, last_leak_us: u64 },
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    expires_at: Instant,
}

/// Mutex-guarded map implementation of [`CounterStore`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: Mutex<HashMap<String, Slot>>,
    updates: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        sweep(&mut self.slots.lock(), Instant::now())
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Run `f` over the live state at `key` and store what it returns.
    fn update<T>(
        &self,
        key: &str,
        ttl: Duration,
        refresh_ttl: bool,
        f: impl FnOnce(Option<SlotState>) -> StoreResult<(SlotState, T)>,
    ) -> StoreResult<T> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let updates = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        if updates % SWEEP_INTERVAL == 0 {
            let removed = sweep(&mut slots, now);
            trace!(removed, remaining = slots.len(), "Swept expired slots");
        }

        let live = slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| (slot.state, slot.expires_at));
        let (state, result) = f(live.map(|(state, _)| state))?;

        let expires_at = match live {
            Some((_, expires_at)) if !refresh_ttl => expires_at,
            _ => now + ttl,
        };
        slots.insert(key.to_string(), Slot { state, expires_at });
        Ok(result)
    }
}

fn sweep(slots: &mut HashMap<String, Slot>, now: Instant) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| slot.expires_at > now);
    before - slots.len()
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::Protocol(format!("key '{}' does not hold {} state", key, expected))
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        request: &CounterRequest,
    ) -> StoreResult<CounterOutcome> {
        let outcome = self.update(key, request.ttl, false, |state| {
            let current = match state {
                None => 0,
                Some(SlotState::Counter(count)) => count,
                Some(_) => return Err(wrong_type(key, "counter")),
            };
            let next = current.saturating_add(request.amount);
            let allowed = next <= request.limit;
            let count = if allowed { next } else { current };
            Ok((SlotState::Counter(count), CounterOutcome { allowed, count }))
        })?;
        trace!(
            key = %key,
            allowed = outcome.allowed,
            count = outcome.count,
            "Incremented counter"
        );
        Ok(outcome)
    }

    async fn token_consume(&self, key: &str, request: &TokenRequest) -> StoreResult<TokenOutcome> {
        let now_us = micros(request.now);
        self.update(key, request.ttl, true, |state| {
            let previous = match state {
                None => None,
                Some(SlotState::Tokens {
                    tokens,
                    last_refill_us,
                }) => Some((tokens, last_refill_us)),
                Some(_) => return Err(wrong_type(key, "token bucket")),
            };
            let (mut tokens, last_refill_us) =
                refill_tokens(previous, now_us, request.refill_per_sec, request.capacity);

            let allowed = tokens >= request.cost;
            if allowed {
                tokens -= request.cost;
            }

            Ok((
                SlotState::Tokens {
                    tokens,
                    last_refill_us,
                },
                TokenOutcome::new(allowed, tokens, request),
            ))
        })
    }

    async fn window_shift(&self, key: &str, request: &WindowRequest) -> StoreResult<WindowOutcome> {
        let now_us = micros(request.now);
        let window_us = micros(request.window).max(1);
        self.update(key, request.ttl, true, |state| {
            let previous = match state {
                None => None,
                Some(SlotState::Window(counts)) => Some(counts),
                Some(_) => return Err(wrong_type(key, "sliding window")),
            };
            let mut counts = WindowCounts::shift(previous, now_us / window_us);

            let estimated = counts.weighted(now_us, window_us);
            let allowed = estimated + request.cost as f64 <= request.limit as f64;
            if allowed {
                counts.current += request.cost;
            }

            Ok((
                SlotState::Window(counts),
                WindowOutcome {
                    allowed,
                    current_count: counts.current,
                    previous_count: counts.previous,
                    window_start: Duration::from_micros(counts.index * window_us),
                },
            ))
        })
    }

    async fn leak_enqueue(&self, key: &str, request: &LeakRequest) -> StoreResult<LeakOutcome> {
        let now_us = micros(request.now);
        self.update(key, request.ttl, true, |state| {
            let previous = match state {
                None => None,
                Some(SlotState::Queue { depth, last_leak_us }) => Some((depth, last_leak_us)),
                Some(_) => return Err(wrong_type(key, "leaky bucket")),
            };
            let (mut depth, last_leak_us) = drain_queue(previous, now_us, request.drain_per_sec);

            let allowed = depth + request.cost <= request.capacity;
            if allowed {
                depth += request.cost;
            }

            Ok((
                SlotState::Queue {
                    depth,
                    last_leak_us,
                },
                LeakOutcome {
                    allowed,
                    queue_depth: depth,
                },
            ))
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
