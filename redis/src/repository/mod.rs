//! Session repositories.
//!
//! - [`RedisSessionRepository`]: strict, single record key, no events
//! - [`IndexedSessionRepository`]: trigger keys, expiration index, secondary
//!   indexes and lifecycle events

/// Flush-aware mutators shared by both repositories.
///
/// Expanded inside an `impl` block that has `config` and `async fn save`.
macro_rules! flush_aware_mutators {
    () => {
        /// Allocate a new session. Under [`FlushMode::Immediate`] it is saved
        /// before being returned.
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub async fn open_session(&self) -> Result<Session> {
            let mut session = self.create_session();
            self.flush_if_immediate(&mut session).await?;
            Ok(session)
        }

        /// [`Session::set_attribute`], then save under [`FlushMode::Immediate`].
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub async fn set_attribute(
            &self,
            session: &mut Session,
            name: impl Into<String>,
            value: impl Into<Vec<u8>>,
        ) -> Result<()> {
            session.set_attribute(name, value);
            self.flush_if_immediate(session).await
        }

        /// [`Session::remove_attribute`], then save under [`FlushMode::Immediate`].
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub async fn remove_attribute(&self, session: &mut Session, name: &str) -> Result<()> {
            session.remove_attribute(name);
            self.flush_if_immediate(session).await
        }

        /// [`Session::set_last_accessed_time`], then save under [`FlushMode::Immediate`].
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub async fn set_last_accessed_time(
            &self,
            session: &mut Session,
            instant: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            session.set_last_accessed_time(instant);
            self.flush_if_immediate(session).await
        }

        /// [`Session::set_max_inactive_interval`], then save under [`FlushMode::Immediate`].
        ///
        /// # Errors
        ///
        /// Propagates errors of the immediate save.
        pub async fn set_max_inactive_interval(
            &self,
            session: &mut Session,
            interval: chrono::Duration,
        ) -> Result<()> {
            session.set_max_inactive_interval(interval);
            self.flush_if_immediate(session).await
        }

        async fn flush_if_immediate(&self, session: &mut Session) -> Result<()> {
            match self.config.flush_mode {
                FlushMode::Immediate => self.save(session).await,
                FlushMode::OnSave => Ok(()),
            }
        }
    };
}

mod indexed;
mod simple;

pub use indexed::{BucketedIndexedSessionRepository, IndexedSessionRepository, SortedIndexedSessionRepository};
pub use simple::RedisSessionRepository;

use crate::keys::KeyLayout;
use crate::store::KeyValueStore;
use ttl_session_core::{Result, SessionRecord, codec};

/// Read and decode a record. `None` if the key holds no fields.
async fn load_record<S: KeyValueStore>(
    store: &S,
    layout: &KeyLayout,
    session_id: &str,
) -> Result<Option<SessionRecord>> {
    let entries = store.hash_get_all(&layout.session_key(session_id)).await?;
    if entries.is_empty() {
        return Ok(None);
    }
    codec::decode(session_id, &codec::from_store(entries)).map(Some)
}
