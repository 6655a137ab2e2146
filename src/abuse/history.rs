//! Bounded per-identity decision history.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One rate limit decision as seen by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub at: Instant,
    pub allowed: bool,
    pub ip: String,
}

/// Decisions for one identity, oldest first.
#[derive(Debug, Clone, Default)]
pub struct History {
    observations: VecDeque<Observation>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation, then drop anything older than `retention` or
    /// beyond `max_len`.
    pub fn push(&mut self, observation: Observation, retention: Duration, max_len: usize) {
        let now = observation.at;
        self.observations.push_back(observation);
        self.prune(now, retention);
        while self.observations.len() > max_len {
            self.observations.pop_front();
        }
    }

    /// Drop observations older than `retention` as of `now`.
    pub fn prune(&mut self, now: Instant, retention: Duration) {
        while let Some(oldest) = self.observations.front() {
            if now.saturating_duration_since(oldest.at) > retention {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Observations no older than `window` as of `now`, oldest first.
    pub fn within(&self, now: Instant, window: Duration) -> impl Iterator<Item = &Observation> {
        self.observations
            .iter()
            .filter(move |o| now.saturating_duration_since(o.at) <= window)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(at: Instant, allowed: bool) -> Observation {
        Observation {
            at,
            allowed,
            ip: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn test_push_respects_max_len() {
        let now = Instant::now();
        let mut history = History::new();
        for _ in 0..10 {
            history.push(observation(now, true), Duration::from_secs(60), 4);
        }
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_push_drops_expired() {
        let start = Instant::now();
        let mut history = History::new();
        history.push(observation(start, false), Duration::from_secs(60), 100);
        history.push(
            observation(start + Duration::from_secs(120), true),
            Duration::from_secs(60),
            100,
        );

        assert_eq!(history.len(), 1);
        assert_eq!(history.within(start + Duration::from_secs(120), Duration::ZERO).filter(|o| o.allowed).count(), 1);
    }

    #[test]
    fn test_within_window() {
        let start = Instant::now();
        let mut history = History::new();
        history.push(observation(start, false), Duration::from_secs(3600), 100);
        history.push(
            observation(start + Duration::from_secs(400), true),
            Duration::from_secs(3600),
            100,
        );

        let now = start + Duration::from_secs(400);
        assert_eq!(history.within(now, Duration::from_secs(300)).count(), 1);
        assert_eq!(history.within(now, Duration::from_secs(600)).count(), 2);
    }
}
