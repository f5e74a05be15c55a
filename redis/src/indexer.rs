//! Secondary index maintenance.
//!
//! Two kinds of sets are kept in lockstep:
//!
//! - `N sessions:index:<name>:<value>`: ids of sessions resolving that pair
//! - `N sessions:<id>:idx`: the index keys a session currently belongs to
//!
//! The second set makes every update a diff against what was stored last
//! time instead of a scan over all possible index keys.

use crate::keys::KeyLayout;
use crate::store::KeyValueStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use ttl_session_core::{Result, SessionError};

/// Maintains index memberships for sessions.
#[derive(Debug, Clone)]
pub struct SessionIndexer<S> {
    store: S,
    layout: Arc<KeyLayout>,
}

impl<S: KeyValueStore> SessionIndexer<S> {
    /// Create an indexer.
    #[must_use]
    pub const fn new(store: S, layout: Arc<KeyLayout>) -> Self {
        Self { store, layout }
    }

    /// Bring `session_id`'s memberships in line with `resolved`.
    ///
    /// A changed value under the same index name is one removal plus one
    /// addition. An empty `resolved` removes every previous membership.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn update(&self, session_id: &str, resolved: &HashMap<String, String>) -> Result<()> {
        let own_key = self.layout.session_index_set_key(session_id);
        let previous = self.store.set_members(&own_key).await?;

        let mut stale = Vec::new();
        let mut kept: HashMap<&str, &str> = HashMap::new();
        for index_key in &previous {
            match self.layout.parse_index_key(index_key) {
                Some((name, value)) if resolved.get(name).map(String::as_str) == Some(value) => {
                    kept.insert(name, value);
                }
                _ => stale.push(index_key.as_str()),
            }
        }

        for index_key in stale {
            self.store.set_remove(index_key, session_id).await?;
            self.store.set_remove(&own_key, index_key).await?;
        }

        for (name, value) in resolved {
            if kept.get(name.as_str()) == Some(&value.as_str()) {
                continue;
            }
            let index_key = self.layout.index_key(name, value);
            self.store.set_add(&index_key, session_id).await?;
            self.store.set_add(&own_key, &index_key).await?;
        }

        Ok(())
    }

    /// Remove `session_id` from every index and drop its own index set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let own_key = self.layout.session_index_set_key(session_id);
        let previous = self.store.set_members(&own_key).await?;
        if previous.is_empty() {
            return Ok(());
        }

        for index_key in &previous {
            self.store.set_remove(index_key, session_id).await?;
        }
        self.store.delete(&own_key).await?;
        Ok(())
    }

    /// Move every membership of `old_id` to `new_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures other than a vanished source set.
    pub async fn move_session(&self, old_id: &str, new_id: &str) -> Result<()> {
        let old_key = self.layout.session_index_set_key(old_id);
        let memberships = self.store.set_members(&old_key).await?;
        if memberships.is_empty() {
            return Ok(());
        }

        for index_key in &memberships {
            self.store.set_remove(index_key, old_id).await?;
            self.store.set_add(index_key, new_id).await?;
        }

        match self
            .store
            .rename(&old_key, &self.layout.session_index_set_key(new_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(SessionError::NoSuchKey(key)) => {
                tracing::debug!(key = %key, "Index set vanished during id rotation");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ids stored under (`index_name`, `index_value`).
    ///
    /// No expiry filtering: callers confirm each record still loads.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn session_ids(&self, index_name: &str, index_value: &str) -> Result<HashSet<String>> {
        let members = self
            .store
            .set_members(&self.layout.index_key(index_name, index_value))
            .await?;
        Ok(members.into_iter().collect())
    }

    /// Index name → value pairs `session_id` is currently stored under.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn indexes_of(&self, session_id: &str) -> Result<HashMap<String, String>> {
        let members = self
            .store
            .set_members(&self.layout.session_index_set_key(session_id))
            .await?;
        Ok(members
            .iter()
            .filter_map(|key| self.layout.parse_index_key(key))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}
