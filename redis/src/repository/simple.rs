//! Strict single-record repository.
//!
//! One hash per session, nothing else: no trigger key, no expiration index,
//! no secondary indexes, no events. The record's own TTL is the session
//! expiry. Saving a session whose record vanished since it was loaded fails
//! with [`SessionError::Invalidated`].

use super::load_record;
use crate::config::RepositoryConfig;
use crate::keys::KeyLayout;
use crate::metrics::SessionMetrics;
use crate::store::KeyValueStore;
use std::sync::Arc;
use ttl_session_core::{
    Clock, FlushMode, Result, Session, SessionError, SessionIdGenerator, SystemClock,
    UuidSessionIdGenerator,
};

/// Redis session repository without expiry events or indexes.
///
/// # Example
///
/// ```
/// use ttl_session_redis::{RedisSessionRepository, RepositoryConfig};
/// use ttl_session_redis::mocks::InMemoryKeyValueStore;
///
/// # async fn example() -> ttl_session_core::Result<()> {
/// let repository = RedisSessionRepository::new(
///     InMemoryKeyValueStore::new(),
///     RepositoryConfig::default(),
/// )?;
///
/// let mut session = repository.create_session();
/// session.set_attribute("cart", b"2 items".to_vec());
/// repository.save(&mut session).await?;
///
/// let found = repository.find_by_id(session.id()).await?;
/// assert!(found.is_some());
/// # Ok(())
/// # }
/// # tokio_test::block_on(example()).unwrap();
/// ```
#[derive(Clone)]
pub struct RedisSessionRepository<S> {
    store: S,
    config: RepositoryConfig,
    layout: Arc<KeyLayout>,
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn SessionIdGenerator>,
}

impl<S: KeyValueStore> RedisSessionRepository<S> {
    /// Create a repository.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` is invalid.
    pub fn new(store: S, config: RepositoryConfig) -> Result<Self> {
        let layout = Arc::new(config.key_layout()?);
        Ok(Self {
            store,
            config,
            layout,
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(UuidSessionIdGenerator),
        })
    }

    /// Use `clock` for timestamps and expiry checks.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `id_generator` for new and rotated ids.
    #[must_use]
    pub fn with_id_generator(mut self, id_generator: Arc<dyn SessionIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// A new repository with `config`, sharing store, clock and id generator.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` is invalid.
    pub fn reconfigure(&self, config: RepositoryConfig) -> Result<Self> {
        Ok(Self::new(self.store.clone(), config)?
            .with_clock(Arc::clone(&self.clock))
            .with_id_generator(Arc::clone(&self.id_generator)))
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Key and channel names in use.
    #[must_use]
    pub fn key_layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Allocate a new, unsaved session.
    #[must_use]
    pub fn create_session(&self) -> Session {
        Session::create(
            Arc::clone(&self.id_generator),
            self.clock.now(),
            self.config.default_max_inactive_interval,
            self.config.save_mode,
        )
    }

    flush_aware_mutators!();

    /// Persist pending changes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalidated`] if the session was saved before
    /// and its record no longer exists, and propagates store failures.
    pub async fn save(&self, session: &mut Session) -> Result<()> {
        if !session.is_new() {
            let stored_key = self.layout.session_key(session.original_id());
            if !self.store.exists(&stored_key).await? {
                return Err(SessionError::Invalidated {
                    session_id: session.original_id().to_string(),
                });
            }
        }

        if session.has_changed_id() {
            if !session.is_new() {
                self.store
                    .rename(
                        &self.layout.session_key(session.original_id()),
                        &self.layout.session_key(session.id()),
                    )
                    .await?;
                SessionMetrics::record_rotation();
            }
            session.commit_id();
        }

        if session.delta().is_empty() {
            return Ok(());
        }

        let session_key = self.layout.session_key(session.id());
        self.store.hash_apply(&session_key, session.delta()).await?;
        match session.record().expires_at() {
            Some(expiry) => {
                self.store.expire_at(&session_key, expiry).await?;
            }
            None => {
                self.store.persist(&session_key).await?;
            }
        }

        tracing::debug!(
            session_id = %session.id(),
            fields = session.delta().len(),
            "Saved session"
        );
        SessionMetrics::record_save(session.is_new());
        session.mark_persisted();
        Ok(())
    }

    /// Load a session. Expired records are deleted and reported as absent.
    ///
    /// # Errors
    ///
    /// Returns a corrupt-record error if the stored record lacks a mandatory
    /// field, and propagates store failures.
    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(record) = load_record(&self.store, &self.layout, session_id).await? else {
            return Ok(None);
        };

        if record.is_expired(self.clock.now()) {
            tracing::debug!(session_id = %session_id, "Deleting expired session on read");
            self.store.delete(&self.layout.session_key(session_id)).await?;
            return Ok(None);
        }

        Ok(Some(Session::loaded(
            record,
            self.config.save_mode,
            Arc::clone(&self.id_generator),
        )))
    }

    /// Delete a session. Deleting an unknown id is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete_by_id(&self, session_id: &str) -> Result<()> {
        if self.store.delete(&self.layout.session_key(session_id)).await? {
            SessionMetrics::record_delete();
        }
        Ok(())
    }
}
