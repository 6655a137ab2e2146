//! Core multi-tier rate limiter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use super::context::RateLimitContext;
use super::key::CounterKey;
use super::tier::{LimitsConfig, Scope, TierConfig};
use crate::error::Result;
use crate::store::CounterStore;

/// Outcome of one tier for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStatus {
    pub tier: String,
    pub scope: Scope,
    /// Count in the current window, including this request
    pub count: u64,
    /// Ceiling applied to this request
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub allowed: bool,
}

/// Combined decision across every tier. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// True only if every tier admitted the request
    pub allowed: bool,
    /// Ceiling of the tier that denied the request, or of the tier with the
    /// least remaining quota
    pub limit: u64,
    /// Minimum remaining quota across tiers, floored at zero
    pub remaining: u64,
    /// Latest window reset across tiers
    pub reset_at: DateTime<Utc>,
    /// First tier, in evaluation order, that denied the request
    pub denied_by: Option<String>,
    /// Per-tier outcomes in evaluation order
    pub tiers: Vec<TierStatus>,
}

impl RateLimitResult {
    /// Seconds a denied caller should wait: until every denying tier has
    /// reset, rounded up, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let reset = self
            .tiers
            .iter()
            .filter(|t| !t.allowed)
            .map(|t| t.reset_at)
            .max()
            .unwrap_or(self.reset_at);

        let millis = (reset - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }

    fn combine(tiers: Vec<TierStatus>, now: DateTime<Utc>) -> Self {
        let allowed = tiers.iter().all(|t| t.allowed);
        let denied_by = tiers.iter().find(|t| !t.allowed).map(|t| t.tier.clone());

        let binding = tiers
            .iter()
            .find(|t| !t.allowed)
            .or_else(|| tiers.iter().min_by_key(|t| t.remaining));

        Self {
            allowed,
            limit: binding.map(|t| t.limit).unwrap_or(0),
            remaining: tiers.iter().map(|t| t.remaining).min().unwrap_or(0),
            reset_at: tiers.iter().map(|t| t.reset_at).max().unwrap_or(now),
            denied_by,
            tiers,
        }
    }
}

/// Evaluates every configured tier against a request context.
///
/// Tiers run in a fixed order (Organization, User, Session, IP) so diagnostic
/// logs are reproducible; the decision does not depend on the order.
pub struct RateLimiter {
    /// Tiers in evaluation order
    tiers: Vec<TierConfig>,
    /// Source configuration, for priority ceilings
    limits: LimitsConfig,
    /// Owner of all counter state
    store: Arc<CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tiers", &self.tiers)
            .field("store", &self.store)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over `store`.
    ///
    /// # Errors
    /// Returns a configuration error if `limits` is invalid.
    pub fn new(limits: LimitsConfig, store: Arc<CounterStore>) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            tiers: limits.ordered_tiers(),
            limits,
            store,
        })
    }

    /// Count this request against every tier and decide.
    pub async fn limit(&self, context: &RateLimitContext) -> RateLimitResult {
        let mut statuses = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            let key = CounterKey::new(&tier.name, tier.scope, tier.scope.value(context));
            let ceiling = self.ceiling(tier, context);

            let snapshot = self.store.increment(&key, tier.window).await;
            let now = Utc::now();
            let allowed = snapshot.count <= ceiling;
            let reset_at = now
                + chrono::Duration::from_std(snapshot.ttl).unwrap_or_else(|_| chrono::Duration::zero());

            trace!(
                key = %key,
                count = snapshot.count,
                limit = ceiling,
                priority = context.clinical_priority,
                "Evaluated tier"
            );

            if !allowed {
                debug!(
                    tier = %tier.name,
                    key = %key,
                    count = snapshot.count,
                    limit = ceiling,
                    "Rate limit exceeded"
                );
            }

            statuses.push(TierStatus {
                tier: tier.name.clone(),
                scope: tier.scope,
                count: snapshot.count,
                limit: ceiling,
                remaining: ceiling.saturating_sub(snapshot.count),
                reset_at,
                allowed,
            });
        }

        RateLimitResult::combine(statuses, Utc::now())
    }

    /// Ceiling for this tier and context. Priority traffic gets the raised
    /// ceiling on User and Session tiers, never an unbounded one.
    fn ceiling(&self, tier: &TierConfig, context: &RateLimitContext) -> u64 {
        if context.clinical_priority {
            if let Some(ceiling) = self.limits.priority_ceiling(tier) {
                return ceiling;
            }
        }
        tier.max_requests
    }

    /// Tiers in evaluation order.
    pub fn tiers(&self) -> &[TierConfig] {
        &self.tiers
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::{MockBehaviour, MockSharedCounters};
    use std::time::{Duration, Instant};

    fn user_tier(max: u64, window: Duration) -> LimitsConfig {
        LimitsConfig::with_tiers(vec![TierConfig::new("user", Scope::User, max, window)])
    }

    fn limiter(limits: LimitsConfig) -> RateLimiter {
        RateLimiter::new(limits, Arc::new(CounterStore::local_only())).unwrap()
    }

    fn context(user: &str) -> RateLimitContext {
        RateLimitContext::new("org-1", user, "s-1", "10.0.0.1")
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let limits = user_tier(0, Duration::from_secs(1));
        assert!(RateLimiter::new(limits, Arc::new(CounterStore::local_only())).is_err());
    }

    #[tokio::test]
    async fn test_admits_up_to_max_then_denies() {
        let limiter = limiter(user_tier(5, Duration::from_secs(60)));
        let ctx = context("u1");

        let mut last_remaining = u64::MAX;
        for i in 1..=5 {
            let result = limiter.limit(&ctx).await;
            assert!(result.allowed, "Request {} should be allowed", i);
            assert!(result.remaining < last_remaining);
            assert_eq!(result.remaining, 5 - i);
            assert_eq!(result.limit, 5);
            last_remaining = result.remaining;
        }

        let result = limiter.limit(&ctx).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.denied_by.as_deref(), Some("user"));
        assert!(result.retry_after_secs(Utc::now()) <= 60);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_remaining() {
        let limiter = limiter(user_tier(3, Duration::from_millis(200)));
        let ctx = context("u1");

        for _ in 0..4 {
            limiter.limit(&ctx).await;
        }
        let denied = limiter.limit(&ctx).await;
        assert!(!denied.allowed);

        let wait = (denied.reset_at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait + Duration::from_millis(20)).await;

        let result = limiter.limit(&ctx).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_users_are_counted_separately() {
        let limiter = limiter(user_tier(1, Duration::from_secs(60)));

        assert!(limiter.limit(&context("u1")).await.allowed);
        assert!(limiter.limit(&context("u2")).await.allowed);
        assert!(!limiter.limit(&context("u1")).await.allowed);
    }

    #[tokio::test]
    async fn test_any_exceeded_tier_denies() {
        let minute = Duration::from_secs(60);
        let limiter = limiter(LimitsConfig::with_tiers(vec![
            TierConfig::new("ip", Scope::Ip, 2, minute),
            TierConfig::new("user", Scope::User, 10, minute),
        ]));

        let first = limiter.limit(&context("u1")).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.limit, 2);
        assert_eq!(first.tiers.len(), 2);
        // Evaluation order is scope order, not configuration order
        assert_eq!(first.tiers[0].scope, Scope::User);
        assert_eq!(first.tiers[1].scope, Scope::Ip);

        limiter.limit(&context("u2")).await;
        let third = limiter.limit(&context("u3")).await;
        assert!(!third.allowed);
        assert_eq!(third.denied_by.as_deref(), Some("ip"));
        assert!(third.tiers[0].allowed);
    }

    #[tokio::test]
    async fn test_reset_at_is_latest_tier_reset() {
        let limiter = limiter(LimitsConfig::with_tiers(vec![
            TierConfig::new("short", Scope::User, 10, Duration::from_secs(1)),
            TierConfig::new("long", Scope::User, 10, Duration::from_secs(3600)),
        ]));

        let result = limiter.limit(&context("u1")).await;
        let long = result.tiers.iter().find(|t| t.tier == "long").unwrap();
        assert_eq!(result.reset_at, long.reset_at);
        assert!(result.reset_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_clinical_priority_raises_ceiling() {
        let limits = LimitsConfig::with_tiers(vec![TierConfig::new(
            "user",
            Scope::User,
            3,
            Duration::from_secs(60),
        )
        .with_priority_ceiling(6)]);
        let limiter = limiter(limits);
        let normal = context("u1");
        let priority = context("u1").with_priority(true);

        for _ in 0..3 {
            assert!(limiter.limit(&normal).await.allowed);
        }
        assert!(!limiter.limit(&normal).await.allowed);

        // Same counter, higher ceiling: counts 5 and 6 pass, 7 fails
        let result = limiter.limit(&priority).await;
        assert!(result.allowed);
        assert_eq!(result.limit, 6);
        assert!(limiter.limit(&priority).await.allowed);
        assert!(!limiter.limit(&priority).await.allowed);
    }

    #[tokio::test]
    async fn test_clinical_priority_does_not_lift_ip_tier() {
        let limiter = limiter(LimitsConfig::with_tiers(vec![TierConfig::new(
            "ip",
            Scope::Ip,
            1,
            Duration::from_secs(60),
        )]));
        let priority = context("u1").with_priority(true);

        assert!(limiter.limit(&priority).await.allowed);
        assert!(!limiter.limit(&priority).await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_over_admit() {
        let limiter = Arc::new(limiter(user_tier(10, Duration::from_secs(60))));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.limit(&context("u1")).await.allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_on_shared_store() {
        let mock = Arc::new(MockSharedCounters::new());
        let store = Arc::new(CounterStore::with_shared(mock.clone(), Duration::from_millis(100)));
        let limiter = Arc::new(RateLimiter::new(user_tier(7, Duration::from_secs(60)), store).unwrap());

        let results = futures::future::join_all(
            (0..30).map(|_| {
                let limiter = limiter.clone();
                async move { limiter.limit(&context("u1")).await }
            }),
        )
        .await;

        assert_eq!(results.iter().filter(|r| r.allowed).count(), 7);
        assert_eq!(mock.increments(), 30);
    }

    #[tokio::test]
    async fn test_store_outage_still_yields_results() {
        let mock = Arc::new(MockSharedCounters::new());
        mock.set_behaviour(MockBehaviour::Hang);
        let store = Arc::new(CounterStore::with_shared(mock, Duration::from_millis(50)));
        let limiter = RateLimiter::new(user_tier(2, Duration::from_secs(60)), store.clone()).unwrap();

        let started = Instant::now();
        let first = limiter.limit(&context("u1")).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(!store.status().redis_connected);

        assert!(limiter.limit(&context("u1")).await.allowed);
        assert!(!limiter.limit(&context("u1")).await.allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let result = RateLimitResult::combine(
            vec![TierStatus {
                tier: "user".into(),
                scope: Scope::User,
                count: 6,
                limit: 5,
                remaining: 0,
                reset_at: now + chrono::Duration::milliseconds(1500),
                allowed: false,
            }],
            now,
        );
        assert_eq!(result.retry_after_secs(now), 2);
        assert_eq!(result.retry_after_secs(now + chrono::Duration::seconds(10)), 1);
    }
}
