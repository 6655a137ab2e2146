//! Service assembly.
//!
//! [`RateLimitService`] wires the extractor, limiter, counter store, abuse
//! detector and event logger together. Every collaborator is constructed
//! explicitly and handed in; nothing is global.

use axum::http::HeaderMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::abuse::{AbuseDetectionResult, AbuseDetector};
use crate::config::{GatekeeperConfig, StoreConfig};
use crate::error::Result;
use crate::events::{EventKind, EventLogger, TracingEventSink};
use crate::ratelimit::{ContextExtractor, RateLimitContext, RateLimitResult, RateLimiter};
use crate::store::{CounterStore, RedisCounterStore, StoreError, StoreStatus};

/// Everything decided about one request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub context: RateLimitContext,
    pub result: RateLimitResult,
    /// Present only for denied requests
    pub abuse: Option<AbuseDetectionResult>,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.result.allowed
    }
}

/// The assembled rate limiting subsystem.
#[derive(Debug)]
pub struct RateLimitService {
    extractor: ContextExtractor,
    limiter: RateLimiter,
    detector: Arc<AbuseDetector>,
    events: EventLogger,
    warning_threshold: f64,
    store_config: StoreConfig,
}

impl RateLimitService {
    /// Assemble a service from already-constructed collaborators.
    ///
    /// # Errors
    /// Returns a configuration error if the configured limits are invalid.
    pub fn from_parts(
        config: &GatekeeperConfig,
        store: Arc<CounterStore>,
        extractor: ContextExtractor,
        events: EventLogger,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            extractor,
            limiter: RateLimiter::new(config.limits.clone(), store)?,
            detector: Arc::new(AbuseDetector::new(config.abuse.clone())),
            events,
            warning_threshold: config.events.warning_threshold,
            store_config: config.store.clone(),
        })
    }

    /// Build the service described by `config`.
    ///
    /// Connects to Redis when `store.redis_url` is set. An unreachable Redis
    /// is not an error: the service starts in fallback mode and the health
    /// check connects later. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the Redis URL is
    /// malformed.
    pub async fn build(config: &GatekeeperConfig) -> Result<Self> {
        config.validate()?;

        let store = match &config.store.redis_url {
            Some(url) => {
                let redis = RedisCounterStore::connect(url, &config.store).await?;
                let connected = redis.is_connected();
                let store = CounterStore::with_shared(Arc::new(redis), config.store.timeout());
                if !connected {
                    store.mark_degraded(&StoreError::Unavailable("no connection at startup".into()));
                }
                store
            }
            None => {
                info!("No Redis URL configured, counting in-process only");
                CounterStore::local_only()
            }
        };

        let events = if config.events.enabled {
            let (logger, _delivery) =
                EventLogger::spawn(Arc::new(TracingEventSink), config.events.buffer_size);
            logger
        } else {
            EventLogger::disabled()
        };

        Self::from_parts(config, Arc::new(store), ContextExtractor::default(), events)
    }

    /// Decide one request from its headers.
    ///
    /// Every decision is recorded with the abuse detector. Denied requests
    /// are classified and emit a `blocked` event (plus an `abuse` event when
    /// flagged); allowed requests close to a limit emit a `warning` event.
    pub async fn check(&self, headers: &HeaderMap) -> Decision {
        let context = self.extractor.extract(headers);
        let result = self.limiter.limit(&context).await;
        self.detector.record_outcome(&context, &result);

        if result.allowed {
            if self.near_limit(&result) {
                self.events.log_event(EventKind::Warning, &context, &result, None);
            }
            return Decision {
                context,
                result,
                abuse: None,
            };
        }

        let abuse = self.detector.detect_context(&context);

        info!(
            org = %context.organization_id,
            user = %context.user_id,
            ip = %context.ip_address,
            tier = result.denied_by.as_deref().unwrap_or_default(),
            limit = result.limit,
            abuse = abuse.is_abuse,
            risk = %abuse.risk_level,
            "Request blocked by rate limit"
        );

        self.events.log_event(EventKind::Blocked, &context, &result, None);
        if abuse.is_abuse {
            self.events.log_event(EventKind::Abuse, &context, &result, Some(&abuse));
        }

        Decision {
            context,
            result,
            abuse: Some(abuse),
        }
    }

    fn near_limit(&self, result: &RateLimitResult) -> bool {
        result.limit > 0 && result.remaining as f64 <= result.limit as f64 * self.warning_threshold
    }

    /// Counter store health, for the `/health` aggregator.
    pub fn status(&self) -> StoreStatus {
        self.limiter.store().status()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start the store health check and both sweepers. They stop when
    /// `shutdown` changes.
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let store = self.limiter.store();
        let mut handles = Vec::with_capacity(3);

        if let Some(handle) =
            store.spawn_health_check(self.store_config.health_check_interval(), shutdown.clone())
        {
            handles.push(handle);
        }
        handles.push(store.spawn_sweeper(self.store_config.sweep_interval(), shutdown.clone()));
        handles.push(self.detector.spawn_sweeper(shutdown));

        debug!(tasks = handles.len(), "Background tasks started");
        handles
    }
}
