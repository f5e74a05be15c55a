//! Redis implementation of [`KeyValueStore`].
//!
//! # Architecture
//!
//! - **Commands** go through a cloned `ConnectionManager` (reconnects on failure)
//! - **Hash deltas** are written in one `MULTI`/`EXEC` pipeline
//! - **Subscriptions** each open a dedicated pub/sub connection from the `Client`
//!
//! # Example
//!
//! ```no_run
//! use ttl_session_redis::store::RedisKeyValueStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await?;
//! store.configure_keyspace_notifications().await?;
//! # Ok(())
//! # }
//! ```

use super::{KeyValueStore, Notification, NotificationStream};
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use ttl_session_core::{FieldMap, FieldValue, Result, SessionError};

const NOTIFY_KEYSPACE_EVENTS: &str = "notify-keyspace-events";

/// Redis-backed key/value store.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    /// Client used to open pub/sub connections.
    client: Client,
    /// Connection manager for regular commands.
    conn_manager: ConnectionManager,
}

impl RedisKeyValueStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379/0")
    ///
    /// # Errors
    ///
    /// Returns error if connection to Redis fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            SessionError::StoreUnavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            SessionError::StoreUnavailable(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        tracing::info!("Connected to Redis");

        Ok(Self {
            client,
            conn_manager,
        })
    }

    /// Make sure the server emits generic and expired key-event notifications.
    ///
    /// Existing `notify-keyspace-events` flags are kept; missing `E`, `g` and
    /// `x` flags are added. Managed Redis offerings often reject `CONFIG`; in
    /// that case configure the flags out of band and skip this call.
    ///
    /// # Errors
    ///
    /// Returns error if `CONFIG GET` or `CONFIG SET` fails.
    pub async fn configure_keyspace_notifications(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();

        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("CONFIG GET", &e))?;
        let current = reply.get(1).map_or("", String::as_str);

        let Some(flags) = merge_notify_flags(current) else {
            tracing::debug!(flags = current, "Keyspace notifications already configured");
            return Ok(());
        };

        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .arg(&flags)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("CONFIG SET", &e))?;

        tracing::info!(previous = current, flags = %flags, "Enabled keyspace notifications");
        Ok(())
    }
}

/// Flags needed on top of `current`, or `None` when nothing is missing.
///
/// `A` is the alias covering `g` and `x`.
///
/// # Examples
///
/// ```
/// use ttl_session_redis::store::merge_notify_flags;
///
/// assert_eq!(merge_notify_flags(""), Some("Egx".to_string()));
/// assert_eq!(merge_notify_flags("KA"), Some("KAE".to_string()));
/// assert_eq!(merge_notify_flags("Egx"), None);
/// ```
#[must_use]
pub fn merge_notify_flags(current: &str) -> Option<String> {
    let has = |flag: char| current.contains(flag);
    let mut merged = current.to_string();

    if !has('E') {
        merged.push('E');
    }
    if !has('A') {
        for flag in ['g', 'x'] {
            if !has(flag) {
                merged.push(flag);
            }
        }
    }

    (merged != current).then_some(merged)
}

fn command_error(command: &str, e: &RedisError) -> SessionError {
    SessionError::StoreUnavailable(format!("Redis {command} failed: {e}"))
}

fn is_no_such_key(e: &RedisError) -> bool {
    e.to_string().to_ascii_lowercase().contains("no such key")
}

impl KeyValueStore for RedisKeyValueStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| command_error("HGETALL", &e))
    }

    async fn hash_apply(&self, key: &str, fields: &FieldMap) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            match value {
                FieldValue::Bytes(bytes) => {
                    pipe.hset(key, field, bytes.as_slice()).ignore();
                }
                FieldValue::Tombstone => {
                    pipe.hdel(key, field).ignore();
                }
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HSET/HDEL pipeline", &e))?;
        Ok(())
    }

    async fn append_empty(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: usize = conn
            .append(key, "")
            .await
            .map_err(|e| command_error("APPEND", &e))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        conn.pexpire(key, ttl.num_milliseconds())
            .await
            .map_err(|e| command_error("PEXPIRE", &e))
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        conn.pexpire_at(key, at.timestamp_millis())
            .await
            .map_err(|e| command_error("PEXPIREAT", &e))
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        conn.persist(key)
            .await
            .map_err(|e| command_error("PERSIST", &e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        conn.exists(key)
            .await
            .map_err(|e| command_error("EXISTS", &e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = conn.del(key).await.map_err(|e| command_error("DEL", &e))?;
        Ok(removed > 0)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let result: redis::RedisResult<()> = conn.rename(from, to).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_no_such_key(&e) => Err(SessionError::NoSuchKey(from.to_string())),
            Err(e) => Err(command_error("RENAME", &e)),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .sadd(key, member)
            .await
            .map_err(|e| command_error("SADD", &e))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .srem(key, member)
            .await
            .map_err(|e| command_error("SREM", &e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        conn.smembers(key)
            .await
            .map_err(|e| command_error("SMEMBERS", &e))
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .zadd(key, member, score)
            .await
            .map_err(|e| command_error("ZADD", &e))?;
        Ok(())
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .zrem(key, member)
            .await
            .map_err(|e| command_error("ZREM", &e))?;
        Ok(())
    }

    async fn sorted_set_rev_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        conn.zrevrangebyscore_limit(key, max, 0, 0, count)
            .await
            .map_err(|e| command_error("ZREVRANGEBYSCORE", &e))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| command_error("PUBLISH", &e))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> Result<NotificationStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| command_error("pub/sub connect", &e))?;

        for channel in &channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| command_error("SUBSCRIBE", &e))?;
        }
        for pattern in &patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| command_error("PSUBSCRIBE", &e))?;
        }

        tracing::info!(?channels, ?patterns, "Subscribed to Redis channels");

        let stream = pubsub.into_on_message().map(|msg| {
            Notification::new(msg.get_channel_name(), msg.get_payload_bytes())
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_existing_flags() {
        assert_eq!(merge_notify_flags("Kl"), Some("KlEgx".to_string()));
        assert_eq!(merge_notify_flags("xE"), Some("xEg".to_string()));
        assert_eq!(merge_notify_flags("AKE"), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_rename_missing_source_is_no_such_key() {
        let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await.unwrap();
        let result = store
            .rename("ttl-session-test:missing", "ttl-session-test:other")
            .await;
        assert!(matches!(result, Err(SessionError::NoSuchKey(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_hash_apply_writes_and_deletes_fields() {
        let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await.unwrap();
        let key = "ttl-session-test:hash";

        let mut fields = FieldMap::new();
        fields.insert("a".into(), FieldValue::Bytes(b"1".to_vec()));
        fields.insert("b".into(), FieldValue::Bytes(b"2".to_vec()));
        store.hash_apply(key, &fields).await.unwrap();

        let mut delta = FieldMap::new();
        delta.insert("a".into(), FieldValue::Tombstone);
        store.hash_apply(key, &delta).await.unwrap();

        let stored = store.hash_get_all(key).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.get("b").map(Vec::as_slice), Some(&b"2"[..]));

        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_rename_keeps_ttl() {
        let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await.unwrap();
        store.append_empty("ttl-session-test:from").await.unwrap();
        store
            .expire("ttl-session-test:from", Duration::seconds(60))
            .await
            .unwrap();
        store
            .rename("ttl-session-test:from", "ttl-session-test:to")
            .await
            .unwrap();

        let mut conn = store.conn_manager.clone();
        let ttl: i64 = conn.ttl("ttl-session-test:to").await.unwrap();
        assert!(ttl > 50 && ttl <= 60, "TTL should survive rename, got {ttl}");

        store.delete("ttl-session-test:to").await.unwrap();
    }
}
