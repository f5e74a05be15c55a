//! Destruction notifier.
//!
//! Turns store notifications into session lifecycle events:
//!
//! | Channel | Body | Event |
//! |---|---|---|
//! | `N event:<D>:created:<id>` | created payload | `Created` |
//! | `__keyevent@<D>__:del` | `N sessions:expires:<id>` | `Deleted` |
//! | `__keyevent@<D>__:expired` | `N sessions:expires:<id>` | `Expired` |
//!
//! Anything else (other namespaces, other databases, record keys) is ignored.
//! Delivery is at-least-once at best: a notification whose record is already
//! gone is logged and dropped.

use crate::expiration::ExpirationIndex;
use crate::keys::KeyLayout;
use crate::metrics::SessionMetrics;
use crate::repository::IndexedSessionRepository;
use crate::store::{KeyValueStore, Notification, NotificationStream};
use futures::StreamExt;
use ttl_session_core::{Result, SessionEvent, SessionEventKind, SessionRecord, codec};

/// What a notification means for the sessions of one key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// A new session was saved; `payload` is its first delta.
    Created {
        /// Id of the new session.
        session_id: String,
        /// Encoded field map written by the first save.
        payload: Vec<u8>,
    },
    /// A trigger key was deleted.
    Deleted(String),
    /// A trigger key expired.
    Expired(String),
    /// Not about this layout's sessions.
    Unrelated,
}

/// Classify `notification` against `layout`.
///
/// # Examples
///
/// ```
/// use ttl_session_redis::{KeyLayout, Notification};
/// use ttl_session_redis::notifier::{NotificationKind, classify};
///
/// let layout = KeyLayout::new("app:", 0);
/// let expired = Notification::new("__keyevent@0__:expired", "app:sessions:expires:42");
/// assert_eq!(classify(&layout, &expired), NotificationKind::Expired("42".to_string()));
///
/// let record = Notification::new("__keyevent@0__:expired", "app:sessions:42");
/// assert_eq!(classify(&layout, &record), NotificationKind::Unrelated);
/// ```
#[must_use]
pub fn classify(layout: &KeyLayout, notification: &Notification) -> NotificationKind {
    if let Some(session_id) = notification
        .channel
        .strip_prefix(layout.created_channel_prefix())
    {
        return NotificationKind::Created {
            session_id: session_id.to_string(),
            payload: notification.body.clone(),
        };
    }

    let is_deleted = notification.channel == layout.deleted_channel();
    let is_expired = notification.channel == layout.expired_channel();
    if !is_deleted && !is_expired {
        return NotificationKind::Unrelated;
    }

    let Some(session_id) = std::str::from_utf8(&notification.body)
        .ok()
        .and_then(|key| layout.session_id_from_expires_key(key))
    else {
        return NotificationKind::Unrelated;
    };

    if is_deleted {
        NotificationKind::Deleted(session_id.to_string())
    } else {
        NotificationKind::Expired(session_id.to_string())
    }
}

impl<S, X> IndexedSessionRepository<S, X>
where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    /// Process one notification.
    ///
    /// # Errors
    ///
    /// Returns corrupt-payload and store errors. Publisher failures are
    /// logged, not returned.
    pub async fn handle_notification(&self, notification: &Notification) -> Result<()> {
        match classify(&self.layout, notification) {
            NotificationKind::Created {
                session_id,
                payload,
            } => {
                let fields = codec::from_payload(&payload)?;
                let record = codec::decode(&session_id, &fields)?;
                self.publish_event(SessionEventKind::Created, record);
                Ok(())
            }
            NotificationKind::Deleted(session_id) => {
                self.destroy(SessionEventKind::Deleted, &session_id).await
            }
            NotificationKind::Expired(session_id) => {
                self.destroy(SessionEventKind::Expired, &session_id).await
            }
            NotificationKind::Unrelated => Ok(()),
        }
    }

    async fn destroy(&self, kind: SessionEventKind, session_id: &str) -> Result<()> {
        let Some(record) = self.load(session_id, true).await? else {
            tracing::warn!(
                session_id = %session_id,
                kind = %kind,
                "Session record already gone, event not published"
            );
            SessionMetrics::record_unresolvable_notification();
            return Ok(());
        };

        self.indexer.delete(session_id).await?;
        self.expiration
            .remove(session_id, record.expires_at())
            .await?;
        self.store
            .delete(&self.layout.session_key(session_id))
            .await?;

        self.publish_event(kind, record);
        Ok(())
    }

    fn publish_event(&self, kind: SessionEventKind, record: SessionRecord) {
        let session_id = record.id.clone();
        match self.publisher.publish(SessionEvent::new(kind, record)) {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, kind = %kind, "Published session event");
                SessionMetrics::record_event_published(kind.as_str());
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    kind = %kind,
                    error = %e,
                    "Failed to publish session event"
                );
            }
        }
    }

    /// Process notifications from `stream` until it ends.
    ///
    /// Errors from individual notifications are logged and do not stop the
    /// loop.
    pub async fn listen(&self, mut stream: NotificationStream) {
        while let Some(notification) = stream.next().await {
            self.handle_notification_logged(&notification).await;
        }
        tracing::info!("Notification stream ended");
    }

    pub(crate) async fn handle_notification_logged(&self, notification: &Notification) {
        if let Err(e) = self.handle_notification(notification).await {
            tracing::error!(
                channel = %notification.channel,
                error = %e,
                "Failed to process session notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn layout() -> KeyLayout {
        KeyLayout::new("app:", 3)
    }

    #[test]
    fn test_created_channel_carries_id_and_payload() {
        let notification = Notification::new("app:event:3:created:abc", vec![1, 2, 3]);
        assert_eq!(
            classify(&layout(), &notification),
            NotificationKind::Created {
                session_id: "abc".to_string(),
                payload: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn test_deleted_trigger_key() {
        let notification = Notification::new("__keyevent@3__:del", "app:sessions:expires:abc");
        assert_eq!(
            classify(&layout(), &notification),
            NotificationKind::Deleted("abc".to_string())
        );
    }

    #[test]
    fn test_other_database_is_unrelated() {
        let notification = Notification::new("__keyevent@0__:expired", "app:sessions:expires:abc");
        assert_eq!(classify(&layout(), &notification), NotificationKind::Unrelated);
    }

    #[test]
    fn test_other_namespace_is_unrelated() {
        let notification =
            Notification::new("__keyevent@3__:expired", "other:sessions:expires:abc");
        assert_eq!(classify(&layout(), &notification), NotificationKind::Unrelated);

        let created = Notification::new("other:event:3:created:abc", Vec::new());
        assert_eq!(classify(&layout(), &created), NotificationKind::Unrelated);
    }

    #[test]
    fn test_non_utf8_body_is_unrelated() {
        let notification = Notification::new("__keyevent@3__:del", vec![0xff, 0xfe]);
        assert_eq!(classify(&layout(), &notification), NotificationKind::Unrelated);
    }
}
