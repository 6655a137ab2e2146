//! Scripted shared backend for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::local::LocalCounterStore;
use super::{CounterSnapshot, SharedCounters, StoreError};
use crate::ratelimit::CounterKey;

/// How the mock answers calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehaviour {
    /// Count like a real shared store
    Healthy,
    /// Fail immediately with a connection error
    Refuse,
    /// Never answer
    Hang,
}

/// In-memory stand-in for Redis with switchable failure modes.
#[derive(Debug)]
pub struct MockSharedCounters {
    counters: LocalCounterStore,
    behaviour: Mutex<MockBehaviour>,
    increments: AtomicUsize,
}

impl MockSharedCounters {
    pub fn new() -> Self {
        Self {
            counters: LocalCounterStore::new(),
            behaviour: Mutex::new(MockBehaviour::Healthy),
            increments: AtomicUsize::new(0),
        }
    }

    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    /// Increments that reached the shared counters.
    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    pub fn count(&self, key: &CounterKey) -> Option<u64> {
        self.counters.get(key)
    }

    async fn answer(&self) -> Result<(), StoreError> {
        let behaviour = *self.behaviour.lock();
        match behaviour {
            MockBehaviour::Healthy => Ok(()),
            MockBehaviour::Refuse => Err(StoreError::Unavailable("connection refused".into())),
            MockBehaviour::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SharedCounters for MockSharedCounters {
    fn provider(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        self.answer().await?;
        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(self.counters.increment(key, window))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.answer().await
    }
}
