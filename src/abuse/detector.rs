//! Heuristic abuse detector.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::history::{History, Observation};
use super::{
    AbuseDetectionResult, RiskLevel, SIGNAL_BURST_PATTERN, SIGNAL_EXCESSIVE_BLOCKS,
    SIGNAL_HIGH_BLOCK_RATIO, SIGNAL_IP_FANOUT,
};
use crate::config::AbuseConfig;
use crate::ratelimit::{RateLimitContext, RateLimitResult, DEFAULT_USER, UNKNOWN_IP};

/// Who a history belongs to within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject {
    User(String),
    /// Unauthenticated traffic, one history per client IP
    Anonymous(String),
}

type Identity = (String, Subject);

/// Classifies per-user decision histories into risk levels.
///
/// Histories are keyed by organization and user, kept for
/// `retention_secs` and capped at `max_history` entries each. Anonymous
/// callers share the default user id, so their histories are kept per
/// client IP instead.
#[derive(Debug)]
pub struct AbuseDetector {
    config: AbuseConfig,
    histories: DashMap<Identity, History>,
}

impl AbuseDetector {
    /// Create a detector with the given thresholds.
    pub fn new(config: AbuseConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    fn identity(organization_id: &str, user_id: &str, ip: &str) -> Identity {
        let subject = if user_id == DEFAULT_USER {
            Subject::Anonymous(ip.to_string())
        } else {
            Subject::User(user_id.to_string())
        };
        (organization_id.to_string(), subject)
    }

    /// Record one decision. Called for every request, allowed or not.
    pub fn record_outcome(&self, context: &RateLimitContext, result: &RateLimitResult) {
        self.record_at(
            &context.organization_id,
            &context.user_id,
            &context.ip_address,
            result.allowed,
            Instant::now(),
        );
    }

    pub(crate) fn record_at(
        &self,
        organization_id: &str,
        user_id: &str,
        ip: &str,
        allowed: bool,
        at: Instant,
    ) {
        let observation = Observation {
            at,
            allowed,
            ip: ip.to_string(),
        };
        self.histories
            .entry(Self::identity(organization_id, user_id, ip))
            .or_default()
            .push(observation, self.config.retention(), self.config.max_history);
    }

    /// Classify the recent behaviour of one identified user.
    pub fn detect(&self, organization_id: &str, user_id: &str) -> AbuseDetectionResult {
        let identity = (organization_id.to_string(), Subject::User(user_id.to_string()));
        self.detect_at(&identity, Instant::now())
    }

    /// Classify the caller behind `context`: the user when identified,
    /// otherwise the anonymous client at its IP.
    pub fn detect_context(&self, context: &RateLimitContext) -> AbuseDetectionResult {
        let identity = Self::identity(
            &context.organization_id,
            &context.user_id,
            &context.ip_address,
        );
        self.detect_at(&identity, Instant::now())
    }

    fn detect_at(&self, identity: &Identity, now: Instant) -> AbuseDetectionResult {
        let Some(history) = self.histories.get(identity) else {
            return AbuseDetectionResult::clean();
        };

        let window = self.config.window();
        let recent: Vec<&Observation> = history.within(now, window).collect();
        if recent.is_empty() {
            return AbuseDetectionResult::clean();
        }

        let mut signals = Vec::new();
        let mut critical = false;

        let total = recent.len();
        let blocked = recent.iter().filter(|o| !o.allowed).count();
        if total >= self.config.min_samples
            && blocked as f64 / total as f64 > self.config.block_ratio_threshold
        {
            signals.push(SIGNAL_HIGH_BLOCK_RATIO.to_string());
        }

        if blocked >= self.config.block_count_threshold {
            signals.push(SIGNAL_EXCESSIVE_BLOCKS.to_string());
        }

        let distinct_ips = recent
            .iter()
            .map(|o| o.ip.as_str())
            .filter(|ip| *ip != UNKNOWN_IP)
            .collect::<HashSet<_>>()
            .len();
        if distinct_ips > self.config.ip_fanout_threshold {
            signals.push(SIGNAL_IP_FANOUT.to_string());
            critical = distinct_ips >= self.config.critical_ip_fanout;
        }

        // Anonymous traffic without an address is many clients, not one
        let single_client = identity.1 != Subject::Anonymous(UNKNOWN_IP.to_string());
        if single_client
            && is_burst(&recent, self.config.burst_min_requests, self.config.burst_max_interval())
        {
            signals.push(SIGNAL_BURST_PATTERN.to_string());
        }

        trace!(
            org = %identity.0,
            subject = ?identity.1,
            total,
            blocked,
            distinct_ips,
            signals = ?signals,
            "Evaluated abuse signals"
        );

        if signals.is_empty() {
            return AbuseDetectionResult::clean();
        }

        AbuseDetectionResult {
            is_abuse: true,
            risk_level: RiskLevel::from_signals(signals.len(), critical),
            signals,
        }
    }

    /// Drop histories with nothing newer than the retention period. Returns
    /// how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let retention = self.config.retention();
        let before = self.histories.len();

        self.histories.retain(|_, history| {
            history.prune(now, retention);
            !history.is_empty()
        });

        before.saturating_sub(self.histories.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.histories.len()
    }

    /// Spawn the periodic history sweep.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = detector.sweep();
                        if evicted > 0 {
                            debug!(evicted, tracked = detector.tracked(), "Swept abuse histories");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Abuse history sweeper stopped");
        })
    }
}

/// The last `min_requests` observations arrived with a mean gap below
/// `max_interval`.
fn is_burst(recent: &[&Observation], min_requests: usize, max_interval: Duration) -> bool {
    if min_requests < 2 || recent.len() < min_requests {
        return false;
    }
    let tail = &recent[recent.len() - min_requests..];
    let span = tail[tail.len() - 1].at.saturating_duration_since(tail[0].at);
    let mean_gap = span / (min_requests as u32 - 1);
    mean_gap < max_interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::DEFAULT_ORGANIZATION;

    fn detector() -> AbuseDetector {
        AbuseDetector::new(AbuseConfig::default())
    }

    fn user(org: &str, user: &str) -> Identity {
        (org.to_string(), Subject::User(user.to_string()))
    }

    fn anonymous(org: &str, ip: &str) -> Identity {
        (org.to_string(), Subject::Anonymous(ip.to_string()))
    }

    #[test]
    fn test_unknown_identity_is_clean() {
        let result = detector().detect("org", "nobody");
        assert!(!result.is_abuse);
        assert!(result.signals.is_empty());
    }

    #[test]
    fn test_mostly_blocked_history_is_at_least_medium() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12 {
            let at = now + Duration::from_secs(i);
            detector.record_at("org", "u1", "10.0.0.1", i < 2, at);
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_secs(12));
        assert!(result.is_abuse);
        assert!(result.risk_level >= RiskLevel::Medium);
        assert!(result.signals.contains(&SIGNAL_HIGH_BLOCK_RATIO.to_string()));
        assert!(result.signals.contains(&SIGNAL_EXCESSIVE_BLOCKS.to_string()));
    }

    #[test]
    fn test_block_ratio_needs_min_samples() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..3 {
            detector.record_at("org", "u1", "10.0.0.1", false, now + Duration::from_secs(i));
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_secs(3));
        assert!(!result.is_abuse);
    }

    #[test]
    fn test_ip_fanout() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..4u64 {
            let ip = format!("10.0.0.{}", i);
            detector.record_at("org", "u1", &ip, true, now + Duration::from_secs(i));
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_secs(5));
        assert_eq!(result.signals, vec![SIGNAL_IP_FANOUT.to_string()]);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_extreme_ip_fanout_is_critical() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12u64 {
            let ip = format!("192.0.2.{}", i);
            detector.record_at("org", "u1", &ip, true, now + Duration::from_secs(i));
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_secs(12));
        assert!(result.is_abuse);
        assert_eq!(result.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_unknown_ip_does_not_fan_out() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..6u64 {
            detector.record_at("org", "u1", UNKNOWN_IP, true, now + Duration::from_secs(i));
        }
        assert!(!detector.detect_at(&user("org", "u1"), now + Duration::from_secs(6)).is_abuse);
    }

    #[test]
    fn test_burst_pattern() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..25u64 {
            detector.record_at("org", "u1", "10.0.0.1", true, now + Duration::from_millis(i * 5));
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_millis(200));
        assert_eq!(result.signals, vec![SIGNAL_BURST_PATTERN.to_string()]);
    }

    #[test]
    fn test_steady_traffic_is_not_a_burst() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..25u64 {
            detector.record_at("org", "u1", "10.0.0.1", true, now + Duration::from_millis(i * 500));
        }

        let result = detector.detect_at(&user("org", "u1"), now + Duration::from_secs(13));
        assert!(!result.is_abuse);
    }

    #[test]
    fn test_old_history_is_ignored() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12u64 {
            detector.record_at("org", "u1", "10.0.0.1", false, now + Duration::from_secs(i));
        }

        let later = now + Duration::from_secs(12 + 301);
        assert!(!detector.detect_at(&user("org", "u1"), later).is_abuse);
    }

    #[test]
    fn test_organizations_are_isolated() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12u64 {
            detector.record_at("org-a", "u1", "10.0.0.1", false, now + Duration::from_secs(i));
        }

        assert!(detector.detect_at(&user("org-a", "u1"), now + Duration::from_secs(12)).is_abuse);
        assert!(!detector.detect_at(&user("org-b", "u1"), now + Duration::from_secs(12)).is_abuse);
    }

    #[test]
    fn test_sweep_drops_idle_identities() {
        let detector = AbuseDetector::new(AbuseConfig {
            window_secs: 60,
            retention_secs: 60,
            ..AbuseConfig::default()
        });
        let now = Instant::now();
        detector.record_at("org", "old", "10.0.0.1", true, now);
        detector.record_at("org", "new", "10.0.0.1", true, now + Duration::from_secs(90));
        assert_eq!(detector.tracked(), 2);

        assert_eq!(detector.sweep_at(now + Duration::from_secs(100)), 1);
        assert_eq!(detector.tracked(), 1);
        assert!(detector.detect_at(&user("org", "old"), now + Duration::from_secs(100)).signals.is_empty());
    }

    #[test]
    fn test_anonymous_clients_are_not_one_user() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..120u64 {
            let ip = format!("198.51.100.{}", i);
            let at = now + Duration::from_millis(i);
            detector.record_at("default-org", DEFAULT_USER, &ip, i < 100, at);
        }

        let later = now + Duration::from_millis(200);
        let result = detector.detect_at(&anonymous("default-org", "198.51.100.119"), later);
        assert!(!result.is_abuse, "{:?}", result.signals);
        assert!(!detector.detect(DEFAULT_ORGANIZATION, DEFAULT_USER).is_abuse);
        assert_eq!(detector.tracked(), 120);
    }

    #[test]
    fn test_anonymous_client_is_tracked_by_ip() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12u64 {
            detector.record_at("org", DEFAULT_USER, "10.0.0.9", false, now + Duration::from_secs(i));
        }

        let context = RateLimitContext::new("org", DEFAULT_USER, "anon-1", "10.0.0.9");
        let result = detector.detect_at(&anonymous("org", "10.0.0.9"), now + Duration::from_secs(12));
        assert!(result.is_abuse);
        assert!(!result.signals.contains(&SIGNAL_IP_FANOUT.to_string()));
        assert!(detector.detect_context(&context).is_abuse);
    }

    #[test]
    fn test_unidentified_anonymous_traffic_is_not_a_burst() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..25u64 {
            detector.record_at("org", DEFAULT_USER, UNKNOWN_IP, true, now + Duration::from_millis(i));
        }

        let result = detector.detect_at(&anonymous("org", UNKNOWN_IP), now + Duration::from_millis(50));
        assert!(!result.is_abuse);
    }

    #[test]
    fn test_identity_parts_do_not_collide() {
        let detector = detector();
        let now = Instant::now();
        for i in 0..12u64 {
            detector.record_at("a/b", "c", "10.0.0.1", false, now + Duration::from_secs(i));
        }

        let later = now + Duration::from_secs(12);
        assert!(detector.detect_at(&user("a/b", "c"), later).is_abuse);
        assert!(!detector.detect_at(&user("a", "b/c"), later).is_abuse);
        assert_eq!(detector.tracked(), 1);
    }
}
