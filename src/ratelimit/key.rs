//! Counter key generation.

use serde::{Deserialize, Serialize};

use super::tier::Scope;

/// A key that uniquely identifies one windowed counter.
///
/// The tier name namespaces the key, so two tiers never share a counter even
/// when they count the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The tier this counter belongs to
    pub tier: String,
    /// The scope the tier counts against
    pub scope: Scope,
    /// The identity value (org id, user id, session id or IP)
    pub value: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(tier: &str, scope: Scope, value: &str) -> Self {
        Self {
            tier: tier.to_string(),
            scope,
            value: value.to_string(),
        }
    }

    /// Convert to a store key string.
    /// Format: "{tier}|{scope}|{value}"
    ///
    /// Tier names are validated to `[A-Za-z0-9_-]` and scopes are fixed
    /// words, so everything after the second `|` is the value.
    pub fn to_store_key(&self) -> String {
        format!("{}|{}|{}", self.tier, self.scope.as_str(), self.value)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
