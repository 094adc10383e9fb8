//! Counter key generation.

use crate::policy::AlgorithmKind;

/// Identifies the counter state of one client on one endpoint under one
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Namespace shared by every key this engine writes
    pub prefix: String,
    pub policy_id: String,
    pub client_id: String,
    pub endpoint: String,
}

impl CounterKey {
    pub fn new(prefix: &str, policy_id: &str, client_id: &str, endpoint: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            policy_id: policy_id.to_string(),
            client_id: client_id.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Physical store key for an algorithm's state.
    ///
    /// The algorithm is part of the key so that changing a policy's algorithm
    /// starts from fresh state instead of misreading the old one.
    pub fn storage_key(&self, algorithm: AlgorithmKind) -> String {
        format!(
            "{}:{}:{}|{}|{}",
            self.prefix, algorithm, self.policy_id, self.client_id, self.endpoint
        )
    }

    /// Physical key for one fixed window.
    pub fn window_key(&self, algorithm: AlgorithmKind, window_index: u64) -> String {
        format!("{}:{}", self.storage_key(algorithm), window_index)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.policy_id, self.client_id, self.endpoint)
    }
}
