//! Redis-backed counter store.
//!
//! Each primitive is a Lua script, so the read-decide-write cycle runs
//! server-side in a single round trip and is atomic across every instance
//! sharing the Redis deployment.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use redis::Script;
use tracing::{debug, error, info};

use super::{
    micros, CounterOutcome, CounterRequest, CounterStore, LeakOutcome, LeakRequest, StoreResult,
    TokenOutcome, TokenRequest, WindowOutcome, WindowRequest,
};
use crate::error::StoreError;

/// Connection settings for [`RedisCounterStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// e.g. `redis://localhost:6379`
    pub url: String,
    pub max_connections: usize,
}

struct Scripts {
    fixed_window: Script,
    token_bucket: Script,
    sliding_window: Script,
    leaky_bucket: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fixed_window: Script::new(include_str!("../../scripts/fixed_window.lua")),
            token_bucket: Script::new(include_str!("../../scripts/token_bucket.lua")),
            sliding_window: Script::new(include_str!("../../scripts/sliding_window.lua")),
            leaky_bucket: Script::new(include_str!("../../scripts/leaky_bucket.lua")),
        }
    }

    fn all(&self) -> [(&'static str, &Script); 4] {
        [
            ("fixed_window", &self.fixed_window),
            ("token_bucket", &self.token_bucket),
            ("sliding_window", &self.sliding_window),
            ("leaky_bucket", &self.leaky_bucket),
        ]
    }
}

/// [`CounterStore`] over a pooled Redis connection.
pub struct RedisCounterStore {
    pool: Pool,
    scripts: Scripts,
}

impl RedisCounterStore {
    /// Create the pool, verify connectivity and preload the scripts.
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            "Creating Redis connection pool"
        );

        let mut settings = PoolSettings::from_url(config.url.clone());
        settings.pool = Some(PoolConfig::new(config.max_connections));
        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(format!("pool creation failed: {}", e)))?;

        let store = Self {
            pool,
            scripts: Scripts::new(),
        };
        store.health_check().await?;
        store.load_scripts().await?;

        info!("Redis counter store ready");
        Ok(store)
    }

    async fn connection(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StoreError::Unavailable(format!("connection pool: {}", e))
        })
    }

    /// Register every script with `SCRIPT LOAD` so calls can use `EVALSHA`.
    async fn load_scripts(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        for (name, script) in self.scripts.all() {
            let sha: String = script.prepare_invoke().load_async(&mut *conn).await?;
            debug!(script = name, sha = %sha, "Loaded Lua script");
        }
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn parse_float(raw: &str, field: &str) -> StoreResult<f64> {
    raw.parse::<f64>()
        .map_err(|e| StoreError::Protocol(format!("invalid {} '{}': {}", field, raw, e)))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        request: &CounterRequest,
    ) -> StoreResult<CounterOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, count): (i64, u64) = self
            .scripts
            .fixed_window
            .key(key)
            .arg(request.amount)
            .arg(request.limit)
            .arg(ttl_millis(request.ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(CounterOutcome {
            allowed: allowed == 1,
            count,
        })
    }

    async fn token_consume(&self, key: &str, request: &TokenRequest) -> StoreResult<TokenOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, tokens): (i64, String) = self
            .scripts
            .token_bucket
            .key(key)
            .arg(request.refill_per_sec)
            .arg(request.capacity)
            .arg(request.cost)
            .arg(micros(request.now))
            .arg(ttl_millis(request.ttl))
            .invoke_async(&mut *conn)
            .await?;

        let tokens = parse_float(&tokens, "token count")?;
        Ok(TokenOutcome::new(allowed == 1, tokens, request))
    }

    async fn window_shift(&self, key: &str, request: &WindowRequest) -> StoreResult<WindowOutcome> {
        let window_us = micros(request.window).max(1);
        let mut conn = self.connection().await?;
        let (allowed, current, previous, index): (i64, u64, u64, String) = self
            .scripts
            .sliding_window
            .key(key)
            .arg(window_us)
            .arg(request.limit)
            .arg(request.cost)
            .arg(micros(request.now))
            .arg(ttl_millis(request.ttl))
            .invoke_async(&mut *conn)
            .await?;

        let index: u64 = index
            .parse()
            .map_err(|e| StoreError::Protocol(format!("invalid window index '{}': {}", index, e)))?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            current_count: current,
            previous_count: previous,
            window_start: Duration::from_micros(index.saturating_mul(window_us)),
        })
    }

    async fn leak_enqueue(&self, key: &str, request: &LeakRequest) -> StoreResult<LeakOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, depth): (i64, String) = self
            .scripts
            .leaky_bucket
            .key(key)
            .arg(request.drain_per_sec)
            .arg(request.capacity)
            .arg(request.cost)
            .arg(micros(request.now))
            .arg(ttl_millis(request.ttl))
            .invoke_async(&mut *conn)
            .await?;

        Ok(LeakOutcome {
            allowed: allowed == 1,
            queue_depth: parse_float(&depth, "queue depth")?,
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let response: String = redis::cmd("PING").query_async(&mut *conn).await?;
        if response != "PONG" {
            return Err(StoreError::Protocol(format!(
                "unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }
}
