//! Best-effort audit events.
//!
//! Events are handed to a bounded channel and delivered to an [`EventSink`]
//! by a background task. The request path never waits on the sink: when the
//! buffer is full the event is dropped, and sink failures are only logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abuse::AbuseDetectionResult;
use crate::ratelimit::{RateLimitContext, RateLimitResult};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Allowed, but close to a limit
    Warning,
    /// Denied with 429
    Blocked,
    /// Denied and the detector flagged abuse
    Abuse,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub context: RateLimitContext,
    pub result: RateLimitResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abuse: Option<AbuseDetectionResult>,
}

/// Errors from an event sink.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink failed: {0}")]
    Sink(String),
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The external audit collaborator.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(&self, event: &RateLimitEvent) -> Result<(), EventError>;
}

/// Writes audit records as structured `tracing` events on the
/// `gatekeeper::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn log_event(&self, event: &RateLimitEvent) -> Result<(), EventError> {
        let record = serde_json::to_string(event)?;
        info!(
            target: "gatekeeper::audit",
            kind = ?event.kind,
            org = %event.context.organization_id,
            user = %event.context.user_id,
            ip = %event.context.ip_address,
            record = %record,
            "Rate limit audit event"
        );
        Ok(())
    }
}

/// Non-blocking front end to an [`EventSink`].
#[derive(Debug)]
pub struct EventLogger {
    sender: Option<mpsc::Sender<RateLimitEvent>>,
    dropped: AtomicU64,
}

impl EventLogger {
    /// Start delivering events to `sink`, buffering at most `buffer` of them.
    ///
    /// The delivery task ends once the logger is dropped and the buffer has
    /// drained.
    pub fn spawn(sink: Arc<dyn EventSink>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<RateLimitEvent>(buffer.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(e) = sink.log_event(&event).await {
                    warn!(error = %e, kind = ?event.kind, event_id = %event.id, "Failed to deliver audit event");
                }
            }
            debug!("Audit event delivery stopped");
        });

        let logger = Self {
            sender: Some(sender),
            dropped: AtomicU64::new(0),
        };
        (logger, handle)
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event. Never blocks and never fails.
    pub fn log_event(
        &self,
        kind: EventKind,
        context: &RateLimitContext,
        result: &RateLimitResult,
        abuse: Option<&AbuseDetectionResult>,
    ) {
        let Some(sender) = &self.sender else {
            return;
        };

        let event = RateLimitEvent {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            context: context.clone(),
            result: result.clone(),
            abuse: abuse.cloned(),
        };

        if let Err(e) = sender.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(kind = ?event.kind, dropped, "Audit event buffer full, dropping event");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    warn!(kind = ?event.kind, dropped, "Audit event delivery stopped, dropping event");
                }
            }
        }
    }

    /// Events dropped because the buffer was full or delivery had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sink that keeps every event in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryEventSink {
    events: parking_lot::Mutex<Vec<RateLimitEvent>>,
}

#[cfg(test)]
impl MemoryEventSink {
    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MemoryEventSink {
    async fn log_event(&self, event: &RateLimitEvent) -> Result<(), EventError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
