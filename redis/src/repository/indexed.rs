//! Indexed, event-publishing repository.
//!
//! # Architecture
//!
//! Each session is stored as:
//! - **Record**: `N sessions:<id>` hash, TTL = interval + grace period
//! - **Trigger**: `N sessions:expires:<id>`, TTL = interval
//! - **Expiration entry** in the configured [`ExpirationIndex`]
//! - **Index memberships** maintained by [`SessionIndexer`]
//!
//! The trigger expires first; its `expired` (or `del`) key event drives the
//! destruction path in [`crate::notifier`] while the record is still readable.
//! The periodic sweep touches due trigger keys so that path runs on time even
//! when the store's own expiry cycle lags.
//!
//! # Save races
//!
//! Unlike [`RedisSessionRepository`](super::RedisSessionRepository), saving a
//! session whose record has vanished is not an error here. The write is
//! skipped, because recreating part of a record that the destruction path has
//! already cleaned up would leave an unreadable hash behind.

use super::load_record;
use crate::config::RepositoryConfig;
use crate::expiration::{
    BucketedExpirationIndex, ExpirationIndex, SortedSetExpirationIndex, TtlPlan, apply_ttl_plan,
};
use crate::indexer::SessionIndexer;
use crate::keys::KeyLayout;
use crate::metrics::SessionMetrics;
use crate::store::{KeyValueStore, NotificationStream};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use ttl_session_core::codec::{self, MAX_INACTIVE_INTERVAL_KEY};
use ttl_session_core::{
    Clock, FieldMap, FlushMode, IndexResolver, NoopEventPublisher, PRINCIPAL_NAME_INDEX_NAME,
    PrincipalNameIndexResolver, Result, Session, SessionError, SessionEventPublisher,
    SessionIdGenerator, SessionRecord, SystemClock, UuidSessionIdGenerator,
};

/// Indexed repository with a sorted-set expiration index.
pub type SortedIndexedSessionRepository<S> =
    IndexedSessionRepository<S, SortedSetExpirationIndex<S>>;

/// Indexed repository with minute-bucketed expiration sets.
pub type BucketedIndexedSessionRepository<S> =
    IndexedSessionRepository<S, BucketedExpirationIndex<S>>;

/// Session repository with deterministic expiry, secondary indexes and
/// lifecycle events.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ttl_session_core::BroadcastEventPublisher;
/// use ttl_session_redis::{RepositoryConfig, SortedIndexedSessionRepository};
/// use ttl_session_redis::mocks::InMemoryKeyValueStore;
///
/// # async fn example() -> ttl_session_core::Result<()> {
/// let repository = SortedIndexedSessionRepository::new(
///     InMemoryKeyValueStore::new(),
///     RepositoryConfig::default(),
/// )?
/// .with_event_publisher(Arc::new(BroadcastEventPublisher::default()));
///
/// let mut session = repository.create_session();
/// session.set_attribute("principalName", b"alice".to_vec());
/// repository.save(&mut session).await?;
///
/// let sessions = repository.find_by_principal_name("alice").await?;
/// assert!(sessions.contains_key(session.id()));
/// # Ok(())
/// # }
/// # tokio_test::block_on(example()).unwrap();
/// ```
pub struct IndexedSessionRepository<S, X> {
    pub(crate) store: S,
    pub(crate) config: RepositoryConfig,
    pub(crate) layout: Arc<KeyLayout>,
    pub(crate) expiration: X,
    pub(crate) indexer: SessionIndexer<S>,
    pub(crate) index_resolver: Arc<dyn IndexResolver>,
    pub(crate) publisher: Arc<dyn SessionEventPublisher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) id_generator: Arc<dyn SessionIdGenerator>,
}

impl<S, X> IndexedSessionRepository<S, X>
where
    S: KeyValueStore,
    X: ExpirationIndex<S>,
{
    /// Create a repository.
    ///
    /// Defaults: system clock, UUID ids, principal-name index resolver, and
    /// an event publisher that discards everything.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` is invalid.
    pub fn new(store: S, config: RepositoryConfig) -> Result<Self> {
        let layout = Arc::new(config.key_layout()?);
        Ok(Self {
            expiration: X::build(store.clone(), Arc::clone(&layout), &config),
            indexer: SessionIndexer::new(store.clone(), Arc::clone(&layout)),
            store,
            config,
            layout,
            index_resolver: Arc::new(PrincipalNameIndexResolver),
            publisher: Arc::new(NoopEventPublisher),
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(UuidSessionIdGenerator),
        })
    }

    /// Use `clock` for timestamps, expiry checks and sweeps.
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

    /// Resolve index values with `resolver`.
    #[must_use]
    pub fn with_index_resolver(mut self, resolver: Arc<dyn IndexResolver>) -> Self {
        self.index_resolver = resolver;
        self
    }

    /// Publish lifecycle events to `publisher`.
    #[must_use]
    pub fn with_event_publisher(mut self, publisher: Arc<dyn SessionEventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// A new repository with `config`, sharing store and collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` is invalid.
    pub fn reconfigure(&self, config: RepositoryConfig) -> Result<Self> {
        Ok(Self::new(self.store.clone(), config)?
            .with_clock(Arc::clone(&self.clock))
            .with_id_generator(Arc::clone(&self.id_generator))
            .with_index_resolver(Arc::clone(&self.index_resolver))
            .with_event_publisher(Arc::clone(&self.publisher)))
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

    /// Prefix of the channels new sessions are announced on.
    #[must_use]
    pub fn created_channel_prefix(&self) -> &str {
        self.layout.created_channel_prefix()
    }

    /// Native key-event channel carrying deletions.
    #[must_use]
    pub fn deleted_channel(&self) -> String {
        self.layout.deleted_channel()
    }

    /// Native key-event channel carrying expirations.
    #[must_use]
    pub fn expired_channel(&self) -> String {
        self.layout.expired_channel()
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
    /// In order: id rotation, record write, TTL and expiration bookkeeping,
    /// index diff, and for a first save the created announcement. A save with
    /// no changes touches nothing.
    ///
    /// # Errors
    ///
    /// Propagates store failures. A vanished record is not an error.
    pub async fn save(&self, session: &mut Session) -> Result<()> {
        if session.is_new() {
            if session.has_changed_id() {
                session.commit_id();
            }
            let payload = codec::to_payload(session.delta())?;
            self.write_delta(session).await?;
            self.store
                .publish(&self.layout.created_channel(session.id()), &payload)
                .await?;

            tracing::debug!(session_id = %session.id(), "Saved new session");
            SessionMetrics::record_save(true);
            session.mark_persisted();
            return Ok(());
        }

        if session.delta().is_empty() && !session.has_changed_id() {
            return Ok(());
        }

        let stored_key = self.layout.session_key(session.original_id());
        if !self.store.exists(&stored_key).await? {
            tracing::debug!(
                session_id = %session.original_id(),
                "Session record is gone, skipping save"
            );
            session.commit_id();
            session.mark_persisted();
            return Ok(());
        }

        if session.has_changed_id() && !self.rotate(session).await? {
            session.mark_persisted();
            return Ok(());
        }

        if !session.delta().is_empty() {
            self.write_delta(session).await?;
            tracing::debug!(
                session_id = %session.id(),
                fields = session.delta().len(),
                "Saved session"
            );
            SessionMetrics::record_save(false);
        }
        session.mark_persisted();
        Ok(())
    }

    /// Move the stored session from its original id to its current id.
    ///
    /// Returns `false` when the record vanished before it could be renamed;
    /// the session then adopts its new id without writing anything.
    async fn rotate(&self, session: &mut Session) -> Result<bool> {
        let old_id = session.original_id().to_string();
        let new_id = session.id().to_string();

        match self
            .store
            .rename(&self.layout.session_key(&old_id), &self.layout.session_key(&new_id))
            .await
        {
            Ok(()) => {}
            Err(SessionError::NoSuchKey(_)) => {
                tracing::debug!(
                    old_id = %old_id,
                    new_id = %new_id,
                    "Session record vanished before id rotation"
                );
                session.commit_id();
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        match self
            .store
            .rename(&self.layout.expires_key(&old_id), &self.layout.expires_key(&new_id))
            .await
        {
            Ok(()) => {}
            Err(SessionError::NoSuchKey(_)) => {
                tracing::debug!(old_id = %old_id, "Trigger key vanished before id rotation");
            }
            Err(e) => return Err(e),
        }

        self.indexer.move_session(&old_id, &new_id).await?;
        self.expiration
            .rename(&old_id, &new_id, session.persisted_expiry())
            .await?;

        tracing::debug!(old_id = %old_id, new_id = %new_id, "Rotated session id");
        SessionMetrics::record_rotation();
        session.commit_id();
        Ok(true)
    }

    async fn write_delta(&self, session: &Session) -> Result<()> {
        let record = session.record();
        let session_id = record.id.as_str();

        self.store
            .hash_apply(&self.layout.session_key(session_id), session.delta())
            .await?;

        let plan = TtlPlan::for_interval(record.max_inactive_interval, self.config.grace_period);
        apply_ttl_plan(&self.store, &self.layout, session_id, plan).await?;
        match plan {
            TtlPlan::Expire { .. } => {
                self.expiration
                    .save(record, session.persisted_expiry())
                    .await?;
            }
            TtlPlan::Persist | TtlPlan::ExpireNow { .. } => {
                self.expiration
                    .remove(session_id, session.persisted_expiry())
                    .await?;
            }
        }

        // An already expired session gets no memberships: for a new one no
        // trigger ever existed, so no destruction event would remove them.
        if matches!(plan, TtlPlan::ExpireNow { .. }) {
            return self.indexer.delete(session_id).await;
        }
        let resolved = self.index_resolver.resolve_indexes(record);
        self.indexer.update(session_id, &resolved).await
    }

    /// Load a session. Expired sessions are reported as absent.
    ///
    /// # Errors
    ///
    /// Returns a corrupt-record error if the stored record lacks a mandatory
    /// field, and propagates store failures.
    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.load(session_id, false).await?.map(|record| {
            Session::loaded(record, self.config.save_mode, Arc::clone(&self.id_generator))
        }))
    }

    /// Read a record, optionally including logically expired ones.
    ///
    /// Reading an expired record touches its trigger key so the store
    /// expires it and the destruction path runs.
    pub(crate) async fn load(
        &self,
        session_id: &str,
        allow_expired: bool,
    ) -> Result<Option<SessionRecord>> {
        let Some(record) = load_record(&self.store, &self.layout, session_id).await? else {
            return Ok(None);
        };

        if !allow_expired && record.is_expired(self.clock.now()) {
            tracing::debug!(session_id = %session_id, "Found expired session");
            self.store
                .exists(&self.layout.expires_key(session_id))
                .await?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Sessions stored under (`index_name`, `index_value`), keyed by id.
    ///
    /// Ids whose record no longer loads are left out.
    ///
    /// # Errors
    ///
    /// Propagates store failures and corrupt-record errors.
    pub async fn find_by_index_name_and_value(
        &self,
        index_name: &str,
        index_value: &str,
    ) -> Result<HashMap<String, Session>> {
        let ids = self.indexer.session_ids(index_name, index_value).await?;

        let mut sessions = HashMap::with_capacity(ids.len());
        for session_id in ids {
            if let Some(session) = self.find_by_id(&session_id).await? {
                sessions.insert(session_id, session);
            }
        }
        Ok(sessions)
    }

    /// Sessions of one authenticated principal, keyed by id.
    ///
    /// # Errors
    ///
    /// Same as [`find_by_index_name_and_value`](Self::find_by_index_name_and_value).
    pub async fn find_by_principal_name(
        &self,
        principal_name: &str,
    ) -> Result<HashMap<String, Session>> {
        self.find_by_index_name_and_value(PRINCIPAL_NAME_INDEX_NAME, principal_name)
            .await
    }

    /// Delete a session. Unknown ids are a no-op.
    ///
    /// Index memberships and the expiration entry go immediately. The record
    /// is marked expired and kept for the grace period; deleting the trigger
    /// key produces the `del` notification that publishes the deleted event.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete_by_id(&self, session_id: &str) -> Result<()> {
        let Some(record) = self.load(session_id, true).await? else {
            return Ok(());
        };

        self.indexer.delete(session_id).await?;
        self.expiration
            .remove(session_id, record.expires_at())
            .await?;

        let session_key = self.layout.session_key(session_id);
        let mut fields = FieldMap::new();
        fields.insert(
            MAX_INACTIVE_INTERVAL_KEY.to_string(),
            codec::encode_interval(Duration::zero()),
        );
        self.store.hash_apply(&session_key, &fields).await?;
        self.store
            .expire(&session_key, self.config.grace_period)
            .await?;
        self.store
            .delete(&self.layout.expires_key(session_id))
            .await?;

        tracing::debug!(session_id = %session_id, "Deleted session");
        SessionMetrics::record_delete();
        Ok(())
    }

    /// Run one sweep of the expiration index.
    ///
    /// Returns the number of keys touched.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let started = Instant::now();
        let touched = self.expiration.cleanup(self.clock.now()).await?;
        SessionMetrics::record_cleanup(touched, started.elapsed());
        Ok(touched)
    }

    /// Subscribe to the created pattern and the deleted and expired key-event
    /// channels.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn subscribe(&self) -> Result<NotificationStream> {
        self.store
            .subscribe(
                vec![self.layout.deleted_channel(), self.layout.expired_channel()],
                vec![self.layout.created_channel_pattern()],
            )
            .await
    }
}
