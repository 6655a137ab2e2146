//! Abuse detection.
//!
//! The detector keeps its own per-identity decision history, independent of
//! the counter store, and classifies it into a risk level. Its output is
//! advisory: it annotates responses and audit events but never changes a
//! rate limit decision.

mod detector;
mod history;

pub use detector::AbuseDetector;
pub use history::{History, Observation};

use serde::Serialize;

/// Blocked share of recent decisions is above the configured ratio.
pub const SIGNAL_HIGH_BLOCK_RATIO: &str = "high_block_ratio";
/// Recent blocked requests reached the configured count.
pub const SIGNAL_EXCESSIVE_BLOCKS: &str = "excessive_blocks";
/// One user seen from more distinct IPs than allowed.
pub const SIGNAL_IP_FANOUT: &str = "ip_fanout";
/// Sustained run of requests arriving far faster than expected.
pub const SIGNAL_BURST_PATTERN: &str = "burst_pattern";

/// Severity of detected abuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Map a signal count to a level. A critical signal overrides the count.
    pub fn from_signals(count: usize, critical: bool) -> Self {
        if critical {
            return RiskLevel::Critical;
        }
        match count {
            0 | 1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one identity's recent behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseDetectionResult {
    pub is_abuse: bool,
    pub risk_level: RiskLevel,
    pub signals: Vec<String>,
}

impl AbuseDetectionResult {
    /// No signals fired.
    pub fn clean() -> Self {
        Self {
            is_abuse: false,
            risk_level: RiskLevel::Low,
            signals: Vec::new(),
        }
    }

    /// Human-readable summary for the 429 body.
    pub fn warning(&self) -> Option<String> {
        if !self.is_abuse {
            return None;
        }
        Some(format!(
            "Suspicious activity detected ({} risk): {}",
            self.risk_level,
            self.signals.join(", ")
        ))
    }
}
