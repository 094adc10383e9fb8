//! Rate limit policies and their scoping rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The admission algorithm a policy is enforced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    LeakyBucket,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::SlidingWindow => "sliding_window",
            AlgorithmKind::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How narrowly a policy is scoped. Variants are ordered from least to most
/// specific, so `max()` picks the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Specificity {
    Global,
    Endpoint,
    Tenant,
    TenantEndpoint,
    Client,
    ClientTenant,
    ClientEndpoint,
    Exact,
}

/// A rule binding a scope (client, API key, endpoint, tenant) to a quota.
///
/// Unset scope fields are wildcards. An endpoint ending in `*` matches by
/// prefix; any other endpoint must match exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub id: String,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<String>,

    pub algorithm: AlgorithmKind,

    pub limit_for_period: u64,

    pub window_seconds: u64,

    /// Bucket size for token and leaky buckets. Defaults to `limit_for_period`.
    #[serde(default)]
    pub burst_capacity: Option<u64>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Named algorithm profile supplying store timeout and failure handling.
    #[serde(default)]
    pub profile: Option<String>,
}

fn default_active() -> bool {
    true
}

impl RateLimitPolicy {
    /// A global default policy with no scope fields.
    pub fn new(
        id: impl Into<String>,
        algorithm: AlgorithmKind,
        limit_for_period: u64,
        window_seconds: u64,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: None,
            api_key: None,
            endpoint: None,
            tenant_id: None,
            algorithm,
            limit_for_period,
            window_seconds,
            burst_capacity: None,
            priority: 0,
            is_active: true,
            profile: None,
        }
    }

    pub fn for_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn on_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_burst(mut self, burst_capacity: u64) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Effective bucket size for the bucket algorithms.
    pub fn capacity(&self) -> u64 {
        self.burst_capacity.unwrap_or(self.limit_for_period)
    }

    /// Steady-state admission rate in requests per second.
    pub fn rate_per_second(&self) -> f64 {
        self.limit_for_period as f64 / self.window_seconds as f64
    }

    /// Reject policies the engine cannot enforce.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| EngineError::InvalidPolicy {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.limit_for_period == 0 {
            return Err(invalid("limit_for_period must be greater than 0"));
        }
        if self.window_seconds == 0 {
            return Err(invalid("window_seconds must be greater than 0"));
        }
        if let Some(burst) = self.burst_capacity {
            if burst < self.limit_for_period {
                return Err(invalid("burst_capacity must be at least limit_for_period"));
            }
        }
        if matches!(self.endpoint.as_deref(), Some("")) {
            return Err(invalid("endpoint must not be empty when set"));
        }
        Ok(())
    }

    /// Classify how narrowly this policy is scoped.
    pub fn specificity(&self) -> Specificity {
        let has_client = self.client_id.is_some();
        let has_key = self.api_key.is_some();
        let identity = has_client || has_key;
        let endpoint = self.endpoint.is_some();
        let tenant = self.tenant_id.is_some();

        match (identity, endpoint, tenant) {
            (true, true, true) => Specificity::Exact,
            (true, true, false) if has_client && has_key => Specificity::Exact,
            (true, true, false) => Specificity::ClientEndpoint,
            (true, false, true) => Specificity::ClientTenant,
            (true, false, false) => Specificity::Client,
            (false, true, true) => Specificity::TenantEndpoint,
            (false, false, true) => Specificity::Tenant,
            (false, true, false) => Specificity::Endpoint,
            (false, false, false) => Specificity::Global,
        }
    }

    /// Whether every scope field this policy sets matches the request.
    pub fn matches(
        &self,
        client_id: &str,
        api_key: Option<&str>,
        endpoint: &str,
        tenant_id: Option<&str>,
    ) -> bool {
        if let Some(ref client) = self.client_id {
            if client != client_id {
                return false;
            }
        }
        if let Some(ref key) = self.api_key {
            if Some(key.as_str()) != api_key {
                return false;
            }
        }
        if let Some(ref tenant) = self.tenant_id {
            if Some(tenant.as_str()) != tenant_id {
                return false;
            }
        }
        match self.endpoint.as_deref() {
            None => true,
            Some(pattern) => endpoint_matches(pattern, endpoint),
        }
    }
}

fn endpoint_matches(pattern: &str, endpoint: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => endpoint.starts_with(prefix),
        None => pattern == endpoint,
    }
}
