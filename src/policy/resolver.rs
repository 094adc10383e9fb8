//! Policy resolution.
//!
//! Picks the single authoritative policy for a request: the most specific
//! matching scope wins, then the highest priority, then the smallest id.

use std::cmp::{Ordering, Reverse};
use std::sync::Arc;

use tracing::{trace, warn};

use super::model::RateLimitPolicy;

/// The request attributes a policy is resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub client_id: String,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub tenant_id: Option<String>,
}

impl ResolutionKey {
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: None,
            endpoint: endpoint.into(),
            tenant_id: None,
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
}

impl std::fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "client={},endpoint={},tenant={}",
            self.client_id,
            self.endpoint,
            self.tenant_id.as_deref().unwrap_or("-")
        )
    }
}

/// An immutable, pre-validated set of active policies.
#[derive(Debug, Default)]
pub struct PolicyResolver {
    policies: Vec<Arc<RateLimitPolicy>>,
}

impl PolicyResolver {
    /// Build a resolver, dropping inactive policies and those that fail
    /// validation.
    pub fn new(policies: impl IntoIterator<Item = RateLimitPolicy>) -> Self {
        let policies = policies
            .into_iter()
            .filter(|p| p.is_active)
            .filter(|p| match p.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(policy_id = %p.id, error = %e, "Skipping invalid policy");
                    false
                }
            })
            .map(Arc::new)
            .collect();

        Self { policies }
    }

    /// Find the authoritative policy for a request, if any.
    pub fn resolve(&self, key: &ResolutionKey) -> Option<Arc<RateLimitPolicy>> {
        let winner = self
            .policies
            .iter()
            .filter(|p| {
                p.matches(
                    &key.client_id,
                    key.api_key.as_deref(),
                    &key.endpoint,
                    key.tenant_id.as_deref(),
                )
            })
            .max_by(|a, b| rank(a, b))
            .cloned();

        trace!(
            key = %key,
            policy_id = winner.as_ref().map(|p| p.id.as_str()),
            "Resolved policy"
        );

        winner
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> &[Arc<RateLimitPolicy>] {
        &self.policies
    }
}

/// Total order over candidate policies; the greatest one wins.
fn rank(a: &RateLimitPolicy, b: &RateLimitPolicy) -> Ordering {
    (a.specificity(), a.priority, Reverse(a.id.as_str())).cmp(&(
        b.specificity(),
        b.priority,
        Reverse(b.id.as_str()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AlgorithmKind;

    fn policy(id: &str) -> RateLimitPolicy {
        RateLimitPolicy::new(id, AlgorithmKind::FixedWindow, 10, 1)
    }

    fn resolved_id(resolver: &PolicyResolver, key: &ResolutionKey) -> Option<String> {
        resolver.resolve(key).map(|p| p.id.clone())
    }

    fn ladder() -> PolicyResolver {
        PolicyResolver::new(vec![
            policy("global"),
            policy("tenant-eu").for_tenant("eu"),
            policy("acme-eu").for_client("acme").for_tenant("eu"),
            policy("acme-orders").for_client("acme").on_endpoint("/orders*"),
            policy("acme-key-orders")
                .for_client("acme")
                .with_api_key("k1")
                .on_endpoint("/orders*"),
        ])
    }

    #[test]
    fn test_most_specific_scope_wins() {
        let resolver = ladder();

        let key = ResolutionKey::new("acme", "/orders/7")
            .with_api_key("k1")
            .with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("acme-key-orders"));

        let key = ResolutionKey::new("acme", "/orders/7").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("acme-orders"));

        let key = ResolutionKey::new("acme", "/users").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("acme-eu"));

        let key = ResolutionKey::new("globex", "/users").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("tenant-eu"));

        let key = ResolutionKey::new("globex", "/users");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("global"));
    }

    #[test]
    fn test_priority_breaks_ties_within_level() {
        let resolver = PolicyResolver::new(vec![
            policy("low").for_tenant("eu").with_priority(1),
            policy("high").for_tenant("eu").with_priority(9),
        ]);
        let key = ResolutionKey::new("c", "/x").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("high"));
    }

    #[test]
    fn test_specificity_outranks_priority() {
        let resolver = PolicyResolver::new(vec![
            policy("loud-global").with_priority(100),
            policy("tenant").for_tenant("eu"),
        ]);
        let key = ResolutionKey::new("c", "/x").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("tenant"));
    }

    #[test]
    fn test_equal_priority_resolves_to_smallest_id() {
        let resolver = PolicyResolver::new(vec![
            policy("b-policy").for_tenant("eu"),
            policy("a-policy").for_tenant("eu"),
            policy("c-policy").for_tenant("eu"),
        ]);
        let key = ResolutionKey::new("c", "/x").with_tenant("eu");
        assert_eq!(resolved_id(&resolver, &key).as_deref(), Some("a-policy"));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let resolver = PolicyResolver::new(vec![
            policy("z").for_client("acme"),
            policy("y").for_client("acme"),
            policy("x").for_client("acme").with_priority(-1),
        ]);
        let key = ResolutionKey::new("acme", "/x");
        let first = resolved_id(&resolver, &key);
        for _ in 0..50 {
            assert_eq!(resolved_id(&resolver, &key), first);
        }
        assert_eq!(first.as_deref(), Some("y"));
    }

    #[test]
    fn test_inactive_and_invalid_policies_never_match() {
        let resolver = PolicyResolver::new(vec![
            policy("off").for_client("acme").inactive(),
            RateLimitPolicy::new("broken", AlgorithmKind::TokenBucket, 0, 1).for_client("acme"),
        ]);
        assert_eq!(resolver.len(), 0);
        assert!(resolver.resolve(&ResolutionKey::new("acme", "/x")).is_none());
    }

    #[test]
    fn test_no_match_without_global_default() {
        let resolver = PolicyResolver::new(vec![policy("acme").for_client("acme")]);
        assert!(resolver.resolve(&ResolutionKey::new("globex", "/x")).is_none());
    }
}
