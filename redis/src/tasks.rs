//! Background tasks of the indexed repository.
//!
//! Two tasks run per started [`SessionTasks`]:
//!
//! - **Sweep**: calls [`cleanup_expired_sessions`] every `cleanup_interval`.
//!   A tick that arrives while the previous sweep is still running is dropped,
//!   never queued.
//! - **Listener**: feeds the created pattern and the deleted / expired
//!   key-event channels into the destruction notifier.
//!
//! [`cleanup_expired_sessions`]: IndexedSessionRepository::cleanup_expired_sessions

use crate::expiration::ExpirationIndex;
use crate::metrics::SessionMetrics;
use crate::repository::IndexedSessionRepository;
use crate::store::{KeyValueStore, NotificationStream};
use chrono::Duration;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use ttl_session_core::{Result, SessionError};

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the sweep and listener tasks of one repository.
///
/// `start` and `stop` are idempotent; `stop` before `start` does nothing.
/// Dropping a started `SessionTasks` closes the shutdown channel, which ends
/// both tasks at their next wake-up.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ttl_session_redis::{RepositoryConfig, SessionTasks, SortedIndexedSessionRepository};
/// use ttl_session_redis::mocks::InMemoryKeyValueStore;
///
/// # async fn example() -> ttl_session_core::Result<()> {
/// let repository = Arc::new(SortedIndexedSessionRepository::new(
///     InMemoryKeyValueStore::new(),
///     RepositoryConfig::default(),
/// )?);
///
/// let tasks = SessionTasks::new(repository);
/// tasks.start().await?;
/// assert!(tasks.is_running().await);
/// tasks.stop().await;
/// # Ok(())
/// # }
/// # tokio_test::block_on(example()).unwrap();
/// ```
pub struct SessionTasks<S, X> {
    repository: Arc<IndexedSessionRepository<S, X>>,
    running: Mutex<Option<Running>>,
    skipped_ticks: Arc<AtomicU64>,
}

impl<S, X> SessionTasks<S, X>
where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    /// Wrap `repository`. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(repository: Arc<IndexedSessionRepository<S, X>>) -> Self {
        Self {
            repository,
            running: Mutex::new(None),
            skipped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The repository the tasks act on.
    #[must_use]
    pub const fn repository(&self) -> &Arc<IndexedSessionRepository<S, X>> {
        &self.repository
    }

    /// Sweep ticks dropped because the previous sweep was still running.
    #[must_use]
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    /// Whether the tasks are started.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Subscribe to notifications and spawn the sweep and listener tasks.
    ///
    /// The subscription is established before this returns, so notifications
    /// caused afterwards are not missed. A zero `cleanup_interval` disables
    /// the sweep.
    ///
    /// # Errors
    ///
    /// Propagates subscription failures, and returns
    /// [`SessionError::Configuration`] for an out-of-range interval.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Session tasks already running");
            return Ok(());
        }

        let stream = self.repository.subscribe().await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut handles = vec![tokio::spawn(listen_loop(
            Arc::clone(&self.repository),
            stream,
            shutdown_rx.clone(),
        ))];

        let interval = self.repository.config().cleanup_interval;
        if interval > Duration::zero() {
            let period = interval
                .to_std()
                .map_err(|e| SessionError::Configuration(format!("cleanup interval: {e}")))?;
            handles.push(tokio::spawn(sweep_loop(
                Arc::clone(&self.repository),
                period,
                Arc::clone(&self.skipped_ticks),
                shutdown_rx,
            )));
        } else {
            tracing::info!("Periodic expiration sweep disabled");
        }

        tracing::info!(
            cleanup_interval_secs = interval.num_seconds(),
            "Session tasks started"
        );
        *running = Some(Running { shutdown, handles });
        Ok(())
    }

    /// Signal both tasks and wait for them to finish.
    ///
    /// A sweep in progress is aborted.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Session task ended abnormally");
            }
        }
        tracing::info!("Session tasks stopped");
    }
}

pub(crate) async fn listen_loop<S, X>(
    repository: Arc<IndexedSessionRepository<S, X>>,
    mut stream: NotificationStream,
    mut shutdown: watch::Receiver<bool>,
) where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    loop {
        tokio::select! {
            next = stream.next() => {
                let Some(notification) = next else {
                    tracing::warn!("Notification stream ended");
                    break;
                };
                repository.handle_notification_logged(&notification).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn sweep_loop<S, X>(
    repository: Arc<IndexedSessionRepository<S, X>>,
    period: std::time::Duration,
    skipped_ticks: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately.
    ticker.tick().await;

    let in_flight = Arc::new(AtomicBool::new(false));
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.swap(true, Ordering::AcqRel) {
                    tracing::debug!("Previous sweep still running, tick skipped");
                    SessionMetrics::record_cleanup_skipped();
                    skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let repository = Arc::clone(&repository);
                let in_flight = Arc::clone(&in_flight);
                current = Some(tokio::spawn(async move {
                    match repository.cleanup_expired_sessions().await {
                        Ok(touched) => tracing::debug!(touched, "Expiration sweep finished"),
                        Err(e) => tracing::error!(error = %e, "Expiration sweep failed"),
                    }
                    in_flight.store(false, Ordering::Release);
                }));
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(handle) = current {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::RepositoryConfig;
    use crate::expiration::SortedSetExpirationIndex;
    use crate::mocks::InMemoryKeyValueStore;
    use crate::repository::SortedIndexedSessionRepository;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use ttl_session_core::FieldMap;

    type Tasks = SessionTasks<InMemoryKeyValueStore, SortedSetExpirationIndex<InMemoryKeyValueStore>>;

    fn tasks(config: RepositoryConfig) -> Tasks {
        let repository =
            SortedIndexedSessionRepository::new(InMemoryKeyValueStore::new(), config).unwrap();
        SessionTasks::new(Arc::new(repository))
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let tasks = tasks(RepositoryConfig::default());
        tasks.stop().await;
        assert!(!tasks.is_running().await);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let tasks = tasks(RepositoryConfig::default());
        tasks.start().await.unwrap();
        tasks.start().await.unwrap();
        assert!(tasks.is_running().await);

        tasks.stop().await;
        tasks.stop().await;
        assert!(!tasks.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tasks = tasks(RepositoryConfig::default().with_cleanup_interval(Duration::zero()));
        tasks.start().await.unwrap();
        tasks.stop().await;
        tasks.start().await.unwrap();
        assert!(tasks.is_running().await);
        tasks.stop().await;
    }

    /// Store whose sweep query parks until the gate is opened.
    #[derive(Clone, Default)]
    struct GatedStore {
        inner: InMemoryKeyValueStore,
        gate: Arc<Notify>,
        sweeps: Arc<AtomicUsize>,
    }

    impl KeyValueStore for GatedStore {
        async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
            self.inner.hash_get_all(key).await
        }

        async fn hash_apply(&self, key: &str, fields: &FieldMap) -> Result<()> {
            self.inner.hash_apply(key, fields).await
        }

        async fn append_empty(&self, key: &str) -> Result<()> {
            self.inner.append_empty(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
            self.inner.expire_at(key, at).await
        }

        async fn persist(&self, key: &str) -> Result<bool> {
            self.inner.persist(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.inner.rename(from, to).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<()> {
            self.inner.set_add(key, member).await
        }

        async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
            self.inner.set_remove(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>> {
            self.inner.set_members(key).await
        }

        async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
            self.inner.sorted_set_add(key, member, score).await
        }

        async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<()> {
            self.inner.sorted_set_remove(key, member).await
        }

        async fn sorted_set_rev_range_by_score(
            &self,
            key: &str,
            max: i64,
            limit: usize,
        ) -> Result<Vec<String>> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.inner.sorted_set_rev_range_by_score(key, max, limit).await
        }

        async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(
            &self,
            channels: Vec<String>,
            patterns: Vec<String>,
        ) -> Result<NotificationStream> {
            self.inner.subscribe(channels, patterns).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_running_sweep_is_dropped() {
        let store = GatedStore::default();
        let repository = IndexedSessionRepository::<_, SortedSetExpirationIndex<_>>::new(
            store.clone(),
            RepositoryConfig::default().with_cleanup_interval(Duration::seconds(1)),
        )
        .unwrap();
        let tasks = SessionTasks::new(Arc::new(repository));
        tasks.start().await.unwrap();

        // First sweep starts at 1s and parks; the ticks at 2s..5s find it running.
        tokio::time::sleep(std::time::Duration::from_millis(5_500)).await;
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);
        assert!(tasks.skipped_ticks() >= 3, "skipped {}", tasks.skipped_ticks());

        // Nothing was queued: releasing the gate allows exactly one more sweep
        // at the next tick.
        let skipped = tasks.skipped_ticks();
        store.gate.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(1_000)).await;
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 2);
        assert_eq!(tasks.skipped_ticks(), skipped);

        tasks.stop().await;
    }
}
