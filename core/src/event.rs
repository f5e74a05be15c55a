//! Session lifecycle events and the publish capability.
//!
//! Delivery is at-least-once and best-effort: the engine publishes each event
//! once, logs publisher failures, and never retries. Subscribers must tolerate
//! duplicates (the same expiry may be observed through a sweep and a native
//! notification).

use crate::error::{Result, SessionError};
use crate::record::SessionRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Kind of lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEventKind {
    /// First save of a new session.
    Created,
    /// Explicit deletion.
    Deleted,
    /// Expiry after inactivity.
    Expired,
}

impl SessionEventKind {
    /// Lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event carrying a snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// What happened.
    pub kind: SessionEventKind,
    /// Session as reconstructed when the event was produced.
    pub session: SessionRecord,
}

impl SessionEvent {
    /// Create an event.
    #[must_use]
    pub const fn new(kind: SessionEventKind, session: SessionRecord) -> Self {
        Self { kind, session }
    }

    /// Id of the affected session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session.id
    }
}

/// Fire-and-forget event sink.
pub trait SessionEventPublisher: Send + Sync {
    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Publish`] if the sink rejected the event. The
    /// engine logs and drops it.
    fn publish(&self, event: SessionEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

impl SessionEventPublisher for NoopEventPublisher {
    fn publish(&self, _event: SessionEvent) -> Result<()> {
        Ok(())
    }
}

/// Fans events out to every live [`broadcast::Receiver`].
///
/// Publishing with no subscribers is not an error; the event is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventPublisher {
    /// Create a publisher buffering up to `capacity` events per slow receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SessionEventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: SessionEvent) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            tracing::debug!(
                session_id = %event.session.id,
                kind = %event.kind,
                "No subscribers, dropping session event"
            );
            return Ok(());
        }
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| SessionError::Publish(e.to_string()))
    }
}
