//! Policy sources: where the engine reads policies from.
//!
//! Policy management itself lives outside the engine. Whatever owns the
//! policies implements [`PolicySource`] and calls
//! [`PolicyCache::invalidate`](super::PolicyCache::invalidate) after a change.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::model::RateLimitPolicy;
use crate::error::{EngineError, Result};

/// Source of truth for rate limit policies.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Every policy currently defined, active or not.
    async fn fetch_policies(&self) -> Result<Vec<RateLimitPolicy>>;
}

/// On-disk policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub policies: Vec<RateLimitPolicy>,
}

impl PolicyDocument {
    /// Parse a YAML policy document. A bare list of policies is accepted too.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policies) = serde_yaml::from_str::<Vec<RateLimitPolicy>>(yaml) {
            return Ok(Self { policies });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Config(format!("Failed to parse policy document: {}", e)))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy document");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

/// Policies held in memory, mutated by the embedding application.
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    policies: RwLock<Vec<RateLimitPolicy>>,
}

impl StaticPolicySource {
    pub fn new(policies: Vec<RateLimitPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Insert a policy or replace the one with the same id.
    pub fn upsert(&self, policy: RateLimitPolicy) {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
    }

    /// Remove a policy by id. Returns whether it existed.
    pub fn remove(&self, policy_id: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.id != policy_id);
        policies.len() != before
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn fetch_policies(&self) -> Result<Vec<RateLimitPolicy>> {
        Ok(self.policies.read().clone())
    }
}

/// Policies read from a YAML file on every fetch.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch_policies(&self) -> Result<Vec<RateLimitPolicy>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::PolicySource(format!("{}: {}", self.path.display(), e))
        })?;
        let document = PolicyDocument::from_yaml(&contents)?;
        debug!(
            path = %self.path.display(),
            count = document.policies.len(),
            "Fetched policies from file"
        );
        Ok(document.policies)
    }
}
