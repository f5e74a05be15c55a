//! Session facade with write-ahead delta tracking.
//!
//! A [`Session`] wraps a [`SessionRecord`] loaded from (or about to be written
//! to) the store and records every field that changed since load in a delta.
//! Repositories flush the delta on save and then call
//! [`Session::mark_persisted`].
//!
//! Which reads and writes dirty the delta is decided by [`SaveMode`].

use crate::codec::{
    self, CREATION_TIME_KEY, FieldMap, FieldValue, LAST_ACCESSED_TIME_KEY,
    MAX_INACTIVE_INTERVAL_KEY,
};
use crate::environment::SessionIdGenerator;
use crate::record::{SessionRecord, whole_seconds};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Policy deciding which attribute accesses dirty the delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Only attributes written through `set_attribute`/`remove_attribute`.
    #[default]
    OnSetAttribute,
    /// Also attributes read through `get_attribute` (non-absent reads only).
    OnGetAttribute,
    /// Every attribute is re-persisted on every save.
    Always,
}

impl FromStr for SaveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_set_attribute" => Ok(Self::OnSetAttribute),
            "on_get_attribute" => Ok(Self::OnGetAttribute),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown save mode '{other}'")),
        }
    }
}

/// When changes reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only on an explicit save.
    #[default]
    OnSave,
    /// After every mutation made through the repository.
    Immediate,
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_save" => Ok(Self::OnSave),
            "immediate" => Ok(Self::Immediate),
            other => Err(format!("unknown flush mode '{other}'")),
        }
    }
}

/// A session as seen by application code.
///
/// Not safe for concurrent mutation; each instance exclusively owns its delta.
pub struct Session {
    record: SessionRecord,
    delta: FieldMap,
    original_id: String,
    is_new: bool,
    save_mode: SaveMode,
    id_generator: Arc<dyn SessionIdGenerator>,
    persisted_expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.record.id)
            .field("original_id", &self.original_id)
            .field("is_new", &self.is_new)
            .field("save_mode", &self.save_mode)
            .field("dirty_fields", &self.delta.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Allocate a brand new session.
    ///
    /// The delta is seeded with the three mandatory fields, so the first save
    /// always writes a complete record.
    #[must_use]
    pub fn create(
        id_generator: Arc<dyn SessionIdGenerator>,
        now: DateTime<Utc>,
        max_inactive_interval: Duration,
        save_mode: SaveMode,
    ) -> Self {
        let record = SessionRecord::new(id_generator.generate(), now, max_inactive_interval);
        Self::wrap(record, true, save_mode, id_generator)
    }

    /// Wrap a record freshly read from the store.
    #[must_use]
    pub fn loaded(
        record: SessionRecord,
        save_mode: SaveMode,
        id_generator: Arc<dyn SessionIdGenerator>,
    ) -> Self {
        Self::wrap(record, false, save_mode, id_generator)
    }

    fn wrap(
        record: SessionRecord,
        is_new: bool,
        save_mode: SaveMode,
        id_generator: Arc<dyn SessionIdGenerator>,
    ) -> Self {
        let mut delta = FieldMap::new();
        if is_new {
            delta.insert(
                CREATION_TIME_KEY.to_string(),
                codec::encode_instant(record.creation_time),
            );
            delta.insert(
                MAX_INACTIVE_INTERVAL_KEY.to_string(),
                codec::encode_interval(record.max_inactive_interval),
            );
            delta.insert(
                LAST_ACCESSED_TIME_KEY.to_string(),
                codec::encode_instant(record.last_accessed_time),
            );
        }
        if is_new || save_mode == SaveMode::Always {
            for (name, value) in &record.attributes {
                delta.insert(codec::attribute_field(name), FieldValue::Bytes(value.clone()));
            }
        }

        let persisted_expiry = if is_new { None } else { record.expires_at() };

        Self {
            original_id: record.id.clone(),
            record,
            delta,
            is_new,
            save_mode,
            id_generator,
            persisted_expiry,
        }
    }

    /// Current session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Creation time.
    #[must_use]
    pub const fn creation_time(&self) -> DateTime<Utc> {
        self.record.creation_time
    }

    /// Last accessed time.
    #[must_use]
    pub const fn last_accessed_time(&self) -> DateTime<Utc> {
        self.record.last_accessed_time
    }

    /// Max inactive interval.
    #[must_use]
    pub const fn max_inactive_interval(&self) -> Duration {
        self.record.max_inactive_interval
    }

    /// Whether the session is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.record.is_expired(now)
    }

    /// Read an attribute.
    ///
    /// Under [`SaveMode::OnGetAttribute`] a non-absent read also marks the
    /// attribute dirty.
    pub fn get_attribute(&mut self, name: &str) -> Option<&[u8]> {
        let value = self.record.attributes.get(name)?;
        if self.save_mode == SaveMode::OnGetAttribute {
            self.delta
                .insert(codec::attribute_field(name), FieldValue::Bytes(value.clone()));
        }
        Some(value.as_slice())
    }

    /// Names of all attributes.
    #[must_use]
    pub fn attribute_names(&self) -> HashSet<&str> {
        self.record.attributes.keys().map(String::as_str).collect()
    }

    /// Write an attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let value = value.into();
        self.delta
            .insert(codec::attribute_field(&name), FieldValue::Bytes(value.clone()));
        self.record.attributes.insert(name, value);
    }

    /// Remove an attribute. The removal is recorded as a tombstone.
    pub fn remove_attribute(&mut self, name: &str) {
        self.record.attributes.remove(name);
        self.delta
            .insert(codec::attribute_field(name), FieldValue::Tombstone);
    }

    /// Update the last accessed time (truncated to milliseconds).
    pub fn set_last_accessed_time(&mut self, instant: DateTime<Utc>) {
        self.record.last_accessed_time = instant.trunc_subsecs(3);
        self.delta.insert(
            LAST_ACCESSED_TIME_KEY.to_string(),
            codec::encode_instant(self.record.last_accessed_time),
        );
    }

    /// Update the max inactive interval (whole seconds are persisted).
    pub fn set_max_inactive_interval(&mut self, interval: Duration) {
        self.record.max_inactive_interval = whole_seconds(interval);
        self.delta.insert(
            MAX_INACTIVE_INTERVAL_KEY.to_string(),
            codec::encode_interval(self.record.max_inactive_interval),
        );
    }

    /// Replace the in-memory id with a freshly generated one.
    ///
    /// Nothing touches the store until the next save; only the last id
    /// generated before that save is ever persisted.
    pub fn change_session_id(&mut self) -> String {
        let new_id = self.id_generator.generate();
        self.record.id.clone_from(&new_id);
        new_id
    }

    /// Read-only view of the underlying record.
    #[must_use]
    pub const fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Consume the facade, keeping the record.
    #[must_use]
    pub fn into_record(self) -> SessionRecord {
        self.record
    }

    // ─── Persistence hooks used by repositories ───

    /// Id the session is stored under.
    #[must_use]
    pub fn original_id(&self) -> &str {
        &self.original_id
    }

    /// Whether the id changed since load or last save.
    #[must_use]
    pub fn has_changed_id(&self) -> bool {
        self.record.id != self.original_id
    }

    /// Whether the session has never been saved.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    /// Fields changed since load or last save.
    #[must_use]
    pub const fn delta(&self) -> &FieldMap {
        &self.delta
    }

    /// Expiry instant as last persisted, `None` for new or never-expiring sessions.
    #[must_use]
    pub const fn persisted_expiry(&self) -> Option<DateTime<Utc>> {
        self.persisted_expiry
    }

    /// Adopt the current id as the stored one.
    pub fn commit_id(&mut self) {
        self.original_id.clone_from(&self.record.id);
    }

    /// Record a successful flush: clears the delta and the new flag.
    pub fn mark_persisted(&mut self) {
        self.delta.clear();
        self.is_new = false;
        self.persisted_expiry = self.record.expires_at();
    }

    /// Drop pending changes without writing them.
    pub fn discard_delta(&mut self) {
        self.delta.clear();
    }
}
