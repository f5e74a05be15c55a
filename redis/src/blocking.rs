//! Blocking flavor of the repositories.
//!
//! Same algorithms, same store layout: each wrapper owns a small tokio
//! runtime and drives the async repository with `block_on`. The periodic
//! sweep of [`BlockingIndexedSessionRepository`] runs on a dedicated thread;
//! notifications are handled on the runtime's worker.
//!
//! Do not call these from inside an async context; `block_on` panics there.
//! Async code uses [`RedisSessionRepository`] and [`IndexedSessionRepository`]
//! directly.

use crate::config::RepositoryConfig;
use crate::expiration::ExpirationIndex;
use crate::repository::{IndexedSessionRepository, RedisSessionRepository};
use crate::store::{KeyValueStore, RedisKeyValueStore};
use crate::tasks::listen_loop;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use ttl_session_core::{Result, Session, SessionError};

fn build_runtime() -> Result<Arc<Runtime>> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("ttl-session-blocking")
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| SessionError::StoreUnavailable(format!("Failed to start runtime: {e}")))
}

/// Blocking counterparts of the flush-aware repository mutators.
macro_rules! blocking_mutators {
    () => {
        /// Allocate a new session, saved at once under `FlushMode::Immediate`.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub fn open_session(&self) -> Result<Session> {
            self.runtime.block_on(self.repository.open_session())
        }

        /// Write an attribute, saving at once under `FlushMode::Immediate`.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub fn set_attribute(
            &self,
            session: &mut Session,
            name: impl Into<String>,
            value: impl Into<Vec<u8>>,
        ) -> Result<()> {
            self.runtime
                .block_on(self.repository.set_attribute(session, name, value))
        }

        /// Remove an attribute, saving at once under `FlushMode::Immediate`.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub fn remove_attribute(&self, session: &mut Session, name: &str) -> Result<()> {
            self.runtime
                .block_on(self.repository.remove_attribute(session, name))
        }

        /// Change the interval, saving at once under `FlushMode::Immediate`.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub fn set_max_inactive_interval(
            &self,
            session: &mut Session,
            interval: Duration,
        ) -> Result<()> {
            self.runtime
                .block_on(self.repository.set_max_inactive_interval(session, interval))
        }

        /// Touch the session, saving at once under `FlushMode::Immediate`.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub fn set_last_accessed_time(
            &self,
            session: &mut Session,
            instant: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            self.runtime
                .block_on(self.repository.set_last_accessed_time(session, instant))
        }
    };
}

/// Blocking [`RedisSessionRepository`].
pub struct BlockingSessionRepository<S> {
    runtime: Arc<Runtime>,
    repository: RedisSessionRepository<S>,
}

impl<S: KeyValueStore> BlockingSessionRepository<S> {
    /// Wrap `repository` with its own runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StoreUnavailable`] if the runtime cannot start.
    pub fn new(repository: RedisSessionRepository<S>) -> Result<Self> {
        Ok(Self {
            runtime: build_runtime()?,
            repository,
        })
    }

    /// The wrapped async repository.
    #[must_use]
    pub const fn inner(&self) -> &RedisSessionRepository<S> {
        &self.repository
    }

    /// Allocate a new, unsaved session.
    #[must_use]
    pub fn create_session(&self) -> Session {
        self.repository.create_session()
    }

    blocking_mutators!();

    /// See [`RedisSessionRepository::save`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        self.runtime.block_on(self.repository.save(session))
    }

    /// See [`RedisSessionRepository::find_by_id`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn find_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        self.runtime.block_on(self.repository.find_by_id(session_id))
    }

    /// See [`RedisSessionRepository::delete_by_id`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn delete_by_id(&self, session_id: &str) -> Result<()> {
        self.runtime.block_on(self.repository.delete_by_id(session_id))
    }
}

impl BlockingSessionRepository<RedisKeyValueStore> {
    /// Connect to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails or `config` is invalid.
    pub fn connect(redis_url: &str, config: RepositoryConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(RedisKeyValueStore::new(redis_url))?;
        Ok(Self {
            repository: RedisSessionRepository::new(store, config)?,
            runtime,
        })
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    sweeper: Option<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
}

/// Blocking [`IndexedSessionRepository`] with its own background workers.
///
/// # Example
///
/// ```
/// use ttl_session_redis::{BlockingIndexedSessionRepository, RepositoryConfig};
/// use ttl_session_redis::mocks::InMemoryKeyValueStore;
/// use ttl_session_redis::SortedIndexedSessionRepository;
///
/// # fn example() -> ttl_session_core::Result<()> {
/// let repository = BlockingIndexedSessionRepository::new(SortedIndexedSessionRepository::new(
///     InMemoryKeyValueStore::new(),
///     RepositoryConfig::default(),
/// )?)?;
///
/// repository.start()?;
/// let mut session = repository.create_session();
/// session.set_attribute("principalName", b"alice".to_vec());
/// repository.save(&mut session)?;
/// assert_eq!(repository.find_by_principal_name("alice")?.len(), 1);
/// repository.stop();
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub struct BlockingIndexedSessionRepository<S, X> {
    runtime: Arc<Runtime>,
    repository: Arc<IndexedSessionRepository<S, X>>,
    background: Mutex<Option<Background>>,
}

impl<S, X> BlockingIndexedSessionRepository<S, X>
where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    /// Wrap `repository` with its own runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StoreUnavailable`] if the runtime cannot start.
    pub fn new(repository: IndexedSessionRepository<S, X>) -> Result<Self> {
        Ok(Self::with_runtime(build_runtime()?, repository))
    }

    fn with_runtime(runtime: Arc<Runtime>, repository: IndexedSessionRepository<S, X>) -> Self {
        Self {
            runtime,
            repository: Arc::new(repository),
            background: Mutex::new(None),
        }
    }

    /// The wrapped async repository.
    #[must_use]
    pub const fn inner(&self) -> &Arc<IndexedSessionRepository<S, X>> {
        &self.repository
    }

    /// Allocate a new, unsaved session.
    #[must_use]
    pub fn create_session(&self) -> Session {
        self.repository.create_session()
    }

    blocking_mutators!();

    /// See [`IndexedSessionRepository::save`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        self.runtime.block_on(self.repository.save(session))
    }

    /// See [`IndexedSessionRepository::find_by_id`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn find_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        self.runtime.block_on(self.repository.find_by_id(session_id))
    }

    /// See [`IndexedSessionRepository::find_by_index_name_and_value`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn find_by_index_name_and_value(
        &self,
        index_name: &str,
        index_value: &str,
    ) -> Result<HashMap<String, Session>> {
        self.runtime.block_on(
            self.repository
                .find_by_index_name_and_value(index_name, index_value),
        )
    }

    /// See [`IndexedSessionRepository::find_by_principal_name`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn find_by_principal_name(&self, principal_name: &str) -> Result<HashMap<String, Session>> {
        self.runtime
            .block_on(self.repository.find_by_principal_name(principal_name))
    }

    /// See [`IndexedSessionRepository::delete_by_id`].
    ///
    /// # Errors
    ///
    /// Same as the async variant.
    pub fn delete_by_id(&self, session_id: &str) -> Result<()> {
        self.runtime.block_on(self.repository.delete_by_id(session_id))
    }

    /// Run one sweep now. Returns the number of keys touched.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        self.runtime
            .block_on(self.repository.cleanup_expired_sessions())
    }

    /// Whether the background workers are started.
    pub fn is_running(&self) -> bool {
        self.lock_background().is_some()
    }

    /// Subscribe to notifications and start the sweeper thread.
    ///
    /// Idempotent. A zero `cleanup_interval` disables the sweeper. Ticks that
    /// elapse during a long sweep are dropped: the next sweep starts one full
    /// interval after the previous one finished.
    ///
    /// # Errors
    ///
    /// Propagates subscription failures, returns
    /// [`SessionError::Configuration`] for an out-of-range interval and
    /// [`SessionError::StoreUnavailable`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut background = self.lock_background();
        if background.is_some() {
            tracing::debug!("Blocking session workers already running");
            return Ok(());
        }

        let stream = self.runtime.block_on(self.repository.subscribe())?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = self.runtime.spawn(listen_loop(
            Arc::clone(&self.repository),
            stream,
            shutdown_rx,
        ));

        let interval = self.repository.config().cleanup_interval;
        let sweeper = if interval > Duration::zero() {
            match self.spawn_sweeper(interval) {
                Ok(sweeper) => Some(sweeper),
                Err(e) => {
                    let _ = shutdown.send(true);
                    return Err(e);
                }
            }
        } else {
            tracing::info!("Periodic expiration sweep disabled");
            None
        };

        tracing::info!(
            cleanup_interval_secs = interval.num_seconds(),
            "Blocking session workers started"
        );
        *background = Some(Background {
            shutdown,
            listener,
            sweeper,
        });
        Ok(())
    }

    fn spawn_sweeper(
        &self,
        interval: Duration,
    ) -> Result<(mpsc::Sender<()>, thread::JoinHandle<()>)> {
        let period = interval
            .to_std()
            .map_err(|e| SessionError::Configuration(format!("cleanup interval: {e}")))?;
        let (stop, stop_rx) = mpsc::channel::<()>();
        let runtime = Arc::clone(&self.runtime);
        let repository = Arc::clone(&self.repository);

        let handle = thread::Builder::new()
            .name("ttl-session-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            match runtime.block_on(repository.cleanup_expired_sessions()) {
                                Ok(touched) => {
                                    tracing::debug!(touched, "Expiration sweep finished");
                                }
                                Err(e) => tracing::error!(error = %e, "Expiration sweep failed"),
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| {
                SessionError::StoreUnavailable(format!("Failed to spawn sweeper thread: {e}"))
            })?;

        Ok((stop, handle))
    }

    /// Stop the background workers and wait for them. Idempotent.
    pub fn stop(&self) {
        let Some(background) = self.lock_background().take() else {
            return;
        };

        let _ = background.shutdown.send(true);
        if let Some((stop, handle)) = background.sweeper {
            let _ = stop.send(());
            if handle.join().is_err() {
                tracing::error!("Sweeper thread panicked");
            }
        }
        if let Err(e) = self.runtime.block_on(background.listener) {
            tracing::error!(error = %e, "Notification listener ended abnormally");
        }
        tracing::info!("Blocking session workers stopped");
    }

    fn lock_background(&self) -> MutexGuard<'_, Option<Background>> {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<X> BlockingIndexedSessionRepository<RedisKeyValueStore, X>
where
    X: ExpirationIndex<RedisKeyValueStore>,
{
    /// Connect to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails or `config` is invalid.
    pub fn connect(redis_url: &str, config: RepositoryConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(RedisKeyValueStore::new(redis_url))?;
        let repository = IndexedSessionRepository::new(store, config)?;
        Ok(Self::with_runtime(runtime, repository))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::mocks::InMemoryKeyValueStore;
    use crate::repository::SortedIndexedSessionRepository;

    #[test]
    fn test_strict_round_trip() {
        let repository = BlockingSessionRepository::new(
            RedisSessionRepository::new(InMemoryKeyValueStore::new(), RepositoryConfig::default())
                .unwrap(),
        )
        .unwrap();

        let mut session = repository.create_session();
        session.set_attribute("a", b"b".to_vec());
        repository.save(&mut session).unwrap();

        let mut found = repository.find_by_id(session.id()).unwrap().unwrap();
        assert_eq!(found.get_attribute("a"), Some(&b"b"[..]));

        repository.delete_by_id(session.id()).unwrap();
        assert!(repository.find_by_id(session.id()).unwrap().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let repository = BlockingIndexedSessionRepository::new(
            SortedIndexedSessionRepository::new(
                InMemoryKeyValueStore::new(),
                RepositoryConfig::default(),
            )
            .unwrap(),
        )
        .unwrap();

        repository.stop();
        repository.start().unwrap();
        repository.start().unwrap();
        assert!(repository.is_running());
        repository.stop();
        repository.stop();
        assert!(!repository.is_running());
    }
}
