//! Key/value store capability.
//!
//! The repositories only need a small slice of Redis: hashes, sets, sorted
//! sets, key TTLs, rename and pub/sub. [`KeyValueStore`] names exactly that
//! slice so the engine can run against [`RedisKeyValueStore`] in production and
//! against the in-memory store in tests.

mod redis_store;

pub use redis_store::{RedisKeyValueStore, merge_notify_flags};

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use ttl_session_core::{FieldMap, Result};

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the message was published to (the concrete channel for
    /// pattern subscriptions).
    pub channel: String,
    /// Raw message body. For key-event channels this is the key name.
    pub body: Vec<u8>,
}

impl Notification {
    /// Create a notification.
    #[must_use]
    pub fn new(channel: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
        }
    }
}

/// Stream of messages from a subscription. Ends when the connection closes.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Key/value store operations used by the session repositories.
///
/// Every key argument is a fully qualified store key. Operations on a key
/// whose TTL has elapsed behave as if the key were absent.
///
/// # Implementation Notes
///
/// - Commands must not be retried by the implementation
/// - `hash_apply` must be atomic
/// - `rename` must fail with `SessionError::NoSuchKey` when the source is absent
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// All fields of a hash. Empty when the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, Vec<u8>>>> + Send;

    /// Atomically write bytes fields and delete tombstoned fields.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn hash_apply(&self, key: &str, fields: &FieldMap) -> impl Future<Output = Result<()>> + Send;

    /// Append an empty string, creating the key if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn append_empty(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Set a relative TTL. A non-positive TTL deletes the key.
    ///
    /// Returns `false` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Set an absolute expiry. An instant in the past deletes the key.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn expire_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Remove any TTL from the key.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn persist(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Whether the key exists. Doubles as a "touch" forcing lazy expiry.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Delete a key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Rename a key, keeping its TTL and overwriting the destination.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoSuchKey` if `from` does not exist and
    /// `SessionError::StoreUnavailable` if the command fails.
    fn rename(&self, from: &str, to: &str) -> impl Future<Output = Result<()>> + Send;

    /// Add a member to a set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn set_add(&self, key: &str, member: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove a member from a set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn set_remove(&self, key: &str, member: &str) -> impl Future<Output = Result<()>> + Send;

    /// Members of a set. Empty when the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn set_members(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Add or re-score a sorted-set member.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a sorted-set member.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn sorted_set_remove(&self, key: &str, member: &str)
    -> impl Future<Output = Result<()>> + Send;

    /// Up to `limit` members with `0 <= score <= max`, highest score first.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn sorted_set_rev_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the command fails.
    fn publish(&self, channel: &str, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Open a subscription to exact channels and glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StoreUnavailable` if the subscription cannot be
    /// established.
    fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<NotificationStream>> + Send;
}
