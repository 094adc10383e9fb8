//! Check request and response types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::policy::{AlgorithmKind, ResolutionKey};

/// How close a client is to exhausting its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl WarningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Low => "low",
            WarningLevel::Medium => "medium",
            WarningLevel::High => "high",
            WarningLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for WarningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An already authenticated request asking for admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Units of quota this request consumes
    #[serde(default = "default_cost")]
    pub cost: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn default_cost() -> u64 {
    1
}

impl CheckRequest {
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: None,
            endpoint: endpoint.into(),
            tenant_id: None,
            cost: default_cost(),
            request_id: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "endpoint must not be empty".to_string(),
            ));
        }
        if self.cost == 0 {
            return Err(EngineError::InvalidRequest(
                "cost must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolution_key(&self) -> ResolutionKey {
        ResolutionKey {
            client_id: self.client_id.clone(),
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

/// The admission decision for one [`CheckRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Whole seconds until the quota is fully restored
    pub reset_time_seconds: u64,
    /// RFC 3339 instant the quota is fully restored
    pub reset_timestamp: String,
    /// Unset when no policy was resolved
    pub algorithm: Option<AlgorithmKind>,
    pub current_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub policy_id: Option<String>,
    pub response_time_ms: u64,
    /// Denied because the quota is exhausted
    pub throttled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub warning_level: WarningLevel,
    pub checked_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl CheckResponse {
    /// Conventional rate limit headers for an HTTP layer to attach.
    pub fn rate_limit_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time_seconds.to_string()),
        ];
        if !self.allowed {
            if let Some(retry) = self.retry_after_seconds {
                headers.push(("Retry-After", retry.to_string()));
            }
        }
        headers
    }
}

/// Round up to whole seconds.
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// `Retry-After` never advertises zero: a denied client waits at least a second.
pub(crate) fn retry_secs(d: Duration) -> u64 {
    ceil_secs(d).max(1)
}
