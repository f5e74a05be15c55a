//! Sorted-set expiration index.
//!
//! One sorted set per namespace (`N sessions:expirations`), member = session
//! id, score = expiry in epoch milliseconds.

use super::ExpirationIndex;
use crate::config::RepositoryConfig;
use crate::keys::KeyLayout;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use ttl_session_core::{Result, SessionRecord};

/// Expiration index backed by a single sorted set.
#[derive(Debug, Clone)]
pub struct SortedSetExpirationIndex<S> {
    store: S,
    layout: Arc<KeyLayout>,
    expirations_key: String,
    batch_size: usize,
}

impl<S: KeyValueStore> SortedSetExpirationIndex<S> {
    async fn touch(&self, session_id: &str) -> Result<bool> {
        // EXISTS on a due key forces the store to expire it and notify.
        let trigger_alive = self.store.exists(&self.layout.expires_key(session_id)).await?;
        let record_alive = self.store.exists(&self.layout.session_key(session_id)).await?;
        Ok(trigger_alive || record_alive)
    }
}

impl<S: KeyValueStore> ExpirationIndex<S> for SortedSetExpirationIndex<S> {
    fn build(store: S, layout: Arc<KeyLayout>, config: &RepositoryConfig) -> Self {
        Self {
            expirations_key: layout.expirations_key(),
            store,
            layout,
            batch_size: config.cleanup_batch_size,
        }
    }

    async fn save(
        &self,
        record: &SessionRecord,
        _previous_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match record.expires_at() {
            Some(expiry) => {
                self.store
                    .sorted_set_add(&self.expirations_key, &record.id, expiry.timestamp_millis())
                    .await
            }
            None => {
                self.store
                    .sorted_set_remove(&self.expirations_key, &record.id)
                    .await
            }
        }
    }

    async fn remove(&self, session_id: &str, _expiry: Option<DateTime<Utc>>) -> Result<()> {
        self.store
            .sorted_set_remove(&self.expirations_key, session_id)
            .await
    }

    async fn rename(
        &self,
        old_id: &str,
        new_id: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.store
            .sorted_set_remove(&self.expirations_key, old_id)
            .await?;
        if let Some(expiry) = expiry {
            self.store
                .sorted_set_add(&self.expirations_key, new_id, expiry.timestamp_millis())
                .await?;
        }
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .store
            .sorted_set_rev_range_by_score(
                &self.expirations_key,
                now.timestamp_millis(),
                self.batch_size,
            )
            .await?;

        let mut touched = 0;
        for session_id in &due {
            if self.touch(session_id).await? {
                touched += 1;
            } else {
                tracing::debug!(
                    session_id = %session_id,
                    "Dropping expiration entry of a session that is already gone"
                );
                self.store
                    .sorted_set_remove(&self.expirations_key, session_id)
                    .await?;
            }
        }

        tracing::debug!(due = due.len(), touched, "Swept sorted expiration index");
        Ok(touched)
    }
}
