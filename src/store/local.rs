//! In-process fallback counters.
//!
//! Used only while the shared store is unreachable. Counters live in a
//! sharded map, so concurrent requests for different keys rarely contend, and
//! each increment holds exactly one entry lock. They are not shared across
//! processes: during an outage each process enforces its own quota.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::CounterSnapshot;
use crate::ratelimit::CounterKey;

/// A fixed-window counter.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Requests counted in the current window
    count: u64,
    /// Window length
    window: Duration,
    /// When the current window started
    window_start: Instant,
}

impl WindowCounter {
    /// Create a counter whose first window starts at `now`.
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            window,
            window_start: now,
        }
    }

    /// Count one request and return the new total for the window.
    pub fn increment(&mut self, now: Instant) -> u64 {
        self.maybe_reset_window(now);
        self.count += 1;
        self.count
    }

    /// Get the current count.
    pub fn current_count(&self) -> u64 {
        self.count
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// Whether the window has fully elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    /// Reset the window if it has expired.
    fn maybe_reset_window(&mut self, now: Instant) {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }
}

/// Map of fallback counters keyed by [`CounterKey`].
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    counters: DashMap<CounterKey, WindowCounter>,
}

impl LocalCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against `key`.
    pub fn increment(&self, key: &CounterKey, window: Duration) -> CounterSnapshot {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| WindowCounter::new(window, now));

        // A reconfigured window takes effect at the next rollover
        if counter.window != window && counter.is_expired(now) {
            counter.window = window;
        }

        let count = counter.increment(now);
        CounterSnapshot {
            count,
            ttl: counter.duration_until_reset(now),
        }
    }

    /// Current count for `key`, if it is tracked.
    pub fn get(&self, key: &CounterKey) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .map(|c| if c.is_expired(now) { 0 } else { c.current_count() })
    }

    /// Evict every counter whose window has elapsed. Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Get the number of tracked counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
