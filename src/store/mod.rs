//! Counter storage with automatic fallback.
//!
//! [`CounterStore`] owns all counter state. It routes each increment to the
//! shared backend while that backend is healthy and to the in-process
//! [`LocalCounterStore`] while it is not. A failed or slow shared call is
//! answered locally and flips the store into fallback mode; the background
//! health check flips it back once the shared backend answers again.

mod local;
#[cfg(test)]
pub(crate) mod mock;
mod redis_store;

pub use self::local::{LocalCounterStore, WindowCounter};
pub use self::redis_store::RedisCounterStore;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ratelimit::CounterKey;

/// Errors from a shared counter backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("shared store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result of one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Count in the current window, including this increment
    pub count: u64,
    /// Time until the current window resets
    pub ttl: Duration,
}

/// A counter backend shared by every process of the deployment.
#[async_trait]
pub trait SharedCounters: Send + Sync {
    /// Name reported by the health endpoint.
    fn provider(&self) -> &'static str;

    /// Atomically count one request against `key` in a window of `window`.
    async fn increment(&self, key: &CounterKey, window: Duration)
        -> Result<CounterSnapshot, StoreError>;

    /// Probe the backend, (re)connecting if needed.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Where increments currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Shared,
    Fallback,
}

/// Store health as reported to the health aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub provider: String,
    pub redis_connected: bool,
    pub mode: StoreMode,
}

/// The backend chosen for one call.
enum Backend<'a> {
    Shared(&'a dyn SharedCounters),
    Local(&'a LocalCounterStore),
}

/// Health-aware counter store.
pub struct CounterStore {
    shared: Option<Arc<dyn SharedCounters>>,
    local: LocalCounterStore,
    connected: AtomicBool,
    timeout: Duration,
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .field("local_counters", &self.local.len())
            .finish()
    }
}

impl CounterStore {
    /// A store that only ever counts in-process.
    pub fn local_only() -> Self {
        Self {
            shared: None,
            local: LocalCounterStore::new(),
            connected: AtomicBool::new(false),
            timeout: Duration::ZERO,
        }
    }

    /// A store backed by `shared`, attempted with a hard `timeout` per call.
    ///
    /// The shared backend is assumed healthy until a call or health check
    /// says otherwise.
    pub fn with_shared(shared: Arc<dyn SharedCounters>, timeout: Duration) -> Self {
        Self {
            shared: Some(shared),
            local: LocalCounterStore::new(),
            connected: AtomicBool::new(true),
            timeout,
        }
    }

    fn backend(&self) -> Backend<'_> {
        match &self.shared {
            Some(shared) if self.connected.load(Ordering::Acquire) => Backend::Shared(shared.as_ref()),
            _ => Backend::Local(&self.local),
        }
    }

    /// Count one request against `key`. Never fails: shared-store problems
    /// are absorbed by the local fallback.
    pub async fn increment(&self, key: &CounterKey, window: Duration) -> CounterSnapshot {
        match self.backend() {
            Backend::Shared(shared) => {
                match tokio::time::timeout(self.timeout, shared.increment(key, window)).await {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        self.mark_degraded(&e);
                        self.local.increment(key, window)
                    }
                    Err(_) => {
                        self.mark_degraded(&StoreError::Timeout(self.timeout));
                        self.local.increment(key, window)
                    }
                }
            }
            Backend::Local(local) => local.increment(key, window),
        }
    }

    pub(crate) fn mark_degraded(&self, error: &StoreError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!(error = %error, "Shared counter store unavailable, switching to in-process fallback");
        } else {
            debug!(error = %error, "Shared counter store call failed while degraded");
        }
    }

    /// Probe the shared backend once and update the mode. Returns whether the
    /// shared backend is healthy.
    pub async fn check_health(&self) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };

        let healthy = matches!(
            tokio::time::timeout(self.timeout.max(Duration::from_millis(500)), shared.ping()).await,
            Ok(Ok(()))
        );

        if healthy {
            if !self.connected.swap(true, Ordering::AcqRel) {
                info!(provider = shared.provider(), "Shared counter store reachable again, leaving fallback mode");
            }
        } else if self.connected.swap(false, Ordering::AcqRel) {
            warn!(provider = shared.provider(), "Shared counter store failed health check, switching to in-process fallback");
        }

        healthy
    }

    /// Current health, for the `/health` aggregator.
    pub fn status(&self) -> StoreStatus {
        let connected = self.shared.is_some() && self.connected.load(Ordering::Acquire);
        StoreStatus {
            provider: self
                .shared
                .as_ref()
                .map(|s| s.provider())
                .unwrap_or("memory")
                .to_string(),
            redis_connected: connected,
            mode: if connected {
                StoreMode::Shared
            } else {
                StoreMode::Fallback
            },
        }
    }

    /// The in-process fallback counters.
    pub fn local(&self) -> &LocalCounterStore {
        &self.local
    }

    /// Evict expired fallback counters.
    pub fn sweep(&self) -> usize {
        self.local.sweep()
    }

    /// Spawn the periodic health check. Each interval carries up to 10%
    /// random jitter.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        self.shared.as_ref()?;
        let store = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
                tokio::select! {
                    _ = tokio::time::sleep(interval + Duration::from_millis(jitter)) => {
                        store.check_health().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Store health check stopped");
        }))
    }

    /// Spawn the periodic sweep of expired fallback counters.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = store.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = store.local.len(), "Swept fallback counters");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Fallback counter sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockBehaviour, MockSharedCounters};
    use super::*;
    use crate::ratelimit::Scope;
    use std::time::Instant;

    fn key() -> CounterKey {
        CounterKey::new("user", Scope::User, "u1")
    }

    fn store_with_mock(timeout: Duration) -> (Arc<MockSharedCounters>, CounterStore) {
        let mock = Arc::new(MockSharedCounters::new());
        let store = CounterStore::with_shared(mock.clone(), timeout);
        (mock, store)
    }

    #[tokio::test]
    async fn test_local_only_status() {
        let store = CounterStore::local_only();
        let status = store.status();
        assert_eq!(status.provider, "memory");
        assert!(!status.redis_connected);
        assert_eq!(status.mode, StoreMode::Fallback);

        assert_eq!(store.increment(&key(), Duration::from_secs(1)).await.count, 1);
        assert!(!store.check_health().await);
    }

    #[tokio::test]
    async fn test_healthy_shared_store_is_used() {
        let (mock, store) = store_with_mock(Duration::from_millis(50));

        store.increment(&key(), Duration::from_secs(60)).await;
        store.increment(&key(), Duration::from_secs(60)).await;

        assert_eq!(mock.count(&key()), Some(2));
        assert!(store.local().is_empty());
        assert!(store.status().redis_connected);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_within_budget() {
        let (mock, store) = store_with_mock(Duration::from_millis(50));
        mock.set_behaviour(MockBehaviour::Hang);

        let started = Instant::now();
        let snapshot = store.increment(&key(), Duration::from_secs(60)).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(snapshot.count, 1);
        assert!(!store.status().redis_connected);

        // Subsequent calls skip the shared store entirely
        let started = Instant::now();
        assert_eq!(store.increment(&key(), Duration::from_secs(60)).await.count, 2);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_connection_error_falls_back() {
        let (mock, store) = store_with_mock(Duration::from_millis(50));
        mock.set_behaviour(MockBehaviour::Refuse);

        assert_eq!(store.increment(&key(), Duration::from_secs(60)).await.count, 1);
        assert_eq!(store.status().mode, StoreMode::Fallback);
        assert_eq!(store.local().get(&key()), Some(1));
        assert_eq!(mock.increments(), 0);
    }

    #[tokio::test]
    async fn test_health_check_restores_shared_mode() {
        let (mock, store) = store_with_mock(Duration::from_millis(50));
        mock.set_behaviour(MockBehaviour::Refuse);
        store.increment(&key(), Duration::from_secs(60)).await;
        assert!(!store.check_health().await);

        mock.set_behaviour(MockBehaviour::Healthy);
        assert!(store.check_health().await);
        assert!(store.status().redis_connected);

        store.increment(&key(), Duration::from_secs(60)).await;
        assert_eq!(mock.count(&key()), Some(1));
    }

    #[tokio::test]
    async fn test_background_health_check_reconnects() {
        let (mock, store) = store_with_mock(Duration::from_millis(20));
        let store = Arc::new(store);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        mock.set_behaviour(MockBehaviour::Refuse);
        store.increment(&key(), Duration::from_secs(60)).await;
        assert!(!store.status().redis_connected);

        let handle = store
            .spawn_health_check(Duration::from_millis(20), shutdown_rx)
            .unwrap();
        mock.set_behaviour(MockBehaviour::Healthy);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.status().redis_connected);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_counters() {
        let store = Arc::new(CounterStore::local_only());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        store.increment(&key(), Duration::from_millis(10)).await;

        let handle = store.spawn_sweeper(Duration::from_millis(20), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.local().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
