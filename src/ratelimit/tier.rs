//! Rate limit tier configuration.
//!
//! A tier binds one identity scope (organization, user, session or IP) to a
//! request ceiling and a window. Tiers are loaded once at startup and
//! validated eagerly; a bad tier is a fatal configuration error.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::context::RateLimitContext;
use crate::error::{GatekeeperError, Result};

/// Identity dimension a tier counts against.
///
/// The declaration order is the evaluation order: Organization, User,
/// Session, IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Organization,
    User,
    Session,
    #[serde(alias = "IP")]
    Ip,
}

impl Scope {
    /// Short, stable name used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Organization => "org",
            Scope::User => "user",
            Scope::Session => "session",
            Scope::Ip => "ip",
        }
    }

    /// Pick the identity value this scope counts against.
    pub fn value<'a>(&self, context: &'a RateLimitContext) -> &'a str {
        match self {
            Scope::Organization => &context.organization_id,
            Scope::User => &context.user_id,
            Scope::Session => &context.session_id,
            Scope::Ip => &context.ip_address,
        }
    }

    /// Whether clinical-priority traffic gets a raised ceiling on this scope.
    pub fn honours_priority(&self) -> bool {
        matches!(self, Scope::User | Scope::Session)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named rate limit tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Unique tier name, also the counter key namespace
    pub name: String,
    /// Identity dimension this tier counts against
    pub scope: Scope,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Window length
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    /// Ceiling for clinical-priority traffic (User and Session tiers only)
    #[serde(default)]
    pub priority_max_requests: Option<u64>,
}

impl TierConfig {
    /// Create a tier without an explicit priority ceiling.
    pub fn new(name: impl Into<String>, scope: Scope, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            scope,
            max_requests,
            window,
            priority_max_requests: None,
        }
    }

    /// Set an explicit clinical-priority ceiling.
    pub fn with_priority_ceiling(mut self, ceiling: u64) -> Self {
        self.priority_max_requests = Some(ceiling);
        self
    }
}

/// The full set of tiers plus the clinical-priority policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Configured tiers, in any order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,

    /// Multiplier applied to User/Session ceilings for priority traffic when a
    /// tier has no explicit `priority_max_requests`
    #[serde(default = "default_priority_multiplier")]
    pub priority_multiplier: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            priority_multiplier: default_priority_multiplier(),
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    let minute = Duration::from_secs(60);
    vec![
        TierConfig::new("organization", Scope::Organization, 1000, minute),
        TierConfig::new("user", Scope::User, 100, minute),
        TierConfig::new("session", Scope::Session, 60, minute),
        TierConfig::new("ip", Scope::Ip, 300, minute),
    ]
}

fn default_priority_multiplier() -> u64 {
    3
}

impl LimitsConfig {
    /// Build a configuration from an explicit tier list.
    pub fn with_tiers(tiers: Vec<TierConfig>) -> Self {
        Self {
            tiers,
            priority_multiplier: default_priority_multiplier(),
        }
    }

    /// Load tiers from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit tiers");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load tiers from a YAML string and validate them.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse tier config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every tier invariant.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(GatekeeperError::Config("at least one tier is required".into()));
        }
        if self.priority_multiplier == 0 {
            return Err(GatekeeperError::Config("priority_multiplier must be > 0".into()));
        }

        let mut names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.is_empty() {
                return Err(GatekeeperError::Config("tier name must not be empty".into()));
            }
            if !tier
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(GatekeeperError::Config(format!(
                    "tier '{}': names may only contain letters, digits, '-' and '_'",
                    tier.name
                )));
            }
            if !names.insert(tier.name.as_str()) {
                return Err(GatekeeperError::Config(format!("duplicate tier name '{}'", tier.name)));
            }
            if tier.max_requests == 0 {
                return Err(GatekeeperError::Config(format!(
                    "tier '{}': max_requests must be > 0",
                    tier.name
                )));
            }
            if tier.window.is_zero() {
                return Err(GatekeeperError::Config(format!(
                    "tier '{}': window must be > 0",
                    tier.name
                )));
            }
            if let Some(ceiling) = tier.priority_max_requests {
                if !tier.scope.honours_priority() {
                    return Err(GatekeeperError::Config(format!(
                        "tier '{}': priority ceilings only apply to user and session tiers",
                        tier.name
                    )));
                }
                if ceiling < tier.max_requests {
                    return Err(GatekeeperError::Config(format!(
                        "tier '{}': priority ceiling {} is below max_requests {}",
                        tier.name, ceiling, tier.max_requests
                    )));
                }
            }
        }

        Ok(())
    }

    /// Tiers sorted into evaluation order. Ties keep their configured order.
    pub fn ordered_tiers(&self) -> Vec<TierConfig> {
        let mut tiers = self.tiers.clone();
        tiers.sort_by_key(|t| t.scope);
        tiers
    }

    /// The ceiling priority traffic is held to on `tier`, if it differs from
    /// the standard one.
    pub fn priority_ceiling(&self, tier: &TierConfig) -> Option<u64> {
        if !tier.scope.honours_priority() {
            return None;
        }
        Some(
            tier.priority_max_requests
                .unwrap_or_else(|| tier.max_requests.saturating_mul(self.priority_multiplier)),
        )
    }
}

/// Serde adapter for durations written as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
