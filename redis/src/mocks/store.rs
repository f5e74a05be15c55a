//! In-memory key/value store for testing.

use crate::store::{KeyValueStore, Notification, NotificationStream};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::future::{Future, ready};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use ttl_session_core::{Clock, FieldMap, FieldValue, Result, SessionError, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    String(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(HashSet<String>),
    SortedSet(HashMap<String, i64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Self::String(_) => false,
            Self::Hash(fields) => fields.is_empty(),
            Self::Set(members) => members.is_empty(),
            Self::SortedSet(members) => members.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    writes: usize,
}

/// Mock key/value store.
///
/// Uses in-memory storage and simulates the Redis behaviors the session
/// repositories depend on:
///
/// - TTLs measured against an injected [`Clock`]
/// - lazy expiry on access, emitting `__keyevent@<db>__:expired`
/// - `__keyevent@<db>__:del` for deletions of existing keys
/// - rename keeping the TTL, failing with `NoSuchKey` on a missing source
/// - empty hashes, sets and sorted sets disappear
/// - pub/sub with `*` and `?` glob patterns
///
/// Clones share the same data.
#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    database: u32,
    notifications: broadcast::Sender<Notification>,
}

impl InMemoryKeyValueStore {
    /// Create an empty store on the system clock, database 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store measuring TTLs with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            database: 0,
            notifications,
        }
    }

    /// Emit key-event notifications for database `database`.
    #[must_use]
    pub const fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Number of mutating commands executed so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Whether `key` exists. Does not count as an access.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !is_due(entry, now))
    }

    /// Remaining TTL of `key`; `None` if absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.lock();
        let entry = state.entries.get(key).filter(|entry| !is_due(entry, now))?;
        entry.expires_at.map(|at| at - now)
    }

    /// All live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| !is_due(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Expire every key whose TTL has elapsed, like the server's active cycle.
    ///
    /// Returns the number of keys expired.
    pub fn run_active_expiry(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let due: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| is_due(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            state.entries.remove(key);
            self.notify_key_event("expired", key);
        }
        due.len()
    }

    /// Remove every key without notifications.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_key_event(&self, event: &str, key: &str) {
        let channel = format!("__keyevent@{}__:{event}", self.database);
        // No receivers is fine.
        let _ = self.notifications.send(Notification::new(channel, key));
    }

    /// Run `op` on the live entry for `key`, expiring it first if due.
    fn access<T>(&self, key: &str, write: bool, op: impl FnOnce(&mut State, &str) -> T) -> T {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.entries.get(key).is_some_and(|entry| is_due(entry, now)) {
            state.entries.remove(key);
            self.notify_key_event("expired", key);
        }
        if write {
            state.writes += 1;
        }
        let result = op(&mut state, key);
        if state.entries.get(key).is_some_and(|entry| entry.value.is_empty()) {
            state.entries.remove(key);
        }
        result
    }

    fn delete_key(&self, state: &mut State, key: &str) -> bool {
        let existed = state.entries.remove(key).is_some();
        if existed {
            self.notify_key_event("del", key);
        }
        existed
    }

    fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        self.access(key, true, |state, key| {
            if !state.entries.contains_key(key) {
                return false;
            }
            if at <= now {
                return self.delete_key(state, key);
            }
            if let Some(entry) = state.entries.get_mut(key) {
                entry.expires_at = Some(at);
            }
            true
        })
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_due(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn wrong_type(key: &str) -> SessionError {
    SessionError::StoreUnavailable(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
    ))
}

fn new_entry(value: Value) -> Entry {
    Entry {
        value,
        expires_at: None,
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, Vec<u8>>>> + Send {
        let result = self.access(key, false, |state, key| match state.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        });
        ready(result)
    }

    fn hash_apply(&self, key: &str, fields: &FieldMap) -> impl Future<Output = Result<()>> + Send {
        let result = if fields.is_empty() {
            Ok(())
        } else {
            self.access(key, true, |state, key| {
                let entry = state
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| new_entry(Value::Hash(HashMap::new())));
                let Value::Hash(stored) = &mut entry.value else {
                    return Err(wrong_type(key));
                };
                for (field, value) in fields {
                    match value {
                        FieldValue::Bytes(bytes) => {
                            stored.insert(field.clone(), bytes.clone());
                        }
                        FieldValue::Tombstone => {
                            stored.remove(field);
                        }
                    }
                }
                Ok(())
            })
        };
        ready(result)
    }

    fn append_empty(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        let result = self.access(key, true, |state, key| {
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| new_entry(Value::String(Vec::new())));
            match entry.value {
                Value::String(_) => Ok(()),
                _ => Err(wrong_type(key)),
            }
        });
        ready(result)
    }

    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send {
        ready(Ok(self.set_expiry(key, self.clock.now() + ttl)))
    }

    fn expire_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send {
        ready(Ok(self.set_expiry(key, at)))
    }

    fn persist(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        let result = self.access(key, true, |state, key| {
            state
                .entries
                .get_mut(key)
                .is_some_and(|entry| entry.expires_at.take().is_some())
        });
        ready(Ok(result))
    }

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        let result = self.access(key, false, |state, key| state.entries.contains_key(key));
        ready(Ok(result))
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        let result = self.access(key, true, |state, key| self.delete_key(state, key));
        ready(Ok(result))
    }

    fn rename(&self, from: &str, to: &str) -> impl Future<Output = Result<()>> + Send {
        let now = self.clock.now();
        let mut state = self.lock();
        state.writes += 1;
        for key in [from, to] {
            if state.entries.get(key).is_some_and(|entry| is_due(entry, now)) {
                state.entries.remove(key);
                self.notify_key_event("expired", key);
            }
        }
        let result = match state.entries.remove(from) {
            Some(entry) => {
                state.entries.insert(to.to_string(), entry);
                Ok(())
            }
            None => Err(SessionError::NoSuchKey(from.to_string())),
        };
        drop(state);
        ready(result)
    }

    fn set_add(&self, key: &str, member: &str) -> impl Future<Output = Result<()>> + Send {
        let result = self.access(key, true, |state, key| {
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| new_entry(Value::Set(HashSet::new())));
            let Value::Set(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            members.insert(member.to_string());
            Ok(())
        });
        ready(result)
    }

    fn set_remove(&self, key: &str, member: &str) -> impl Future<Output = Result<()>> + Send {
        let result = self.access(key, true, |state, key| match state.entries.get_mut(key) {
            None => Ok(()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
        });
        ready(result)
    }

    fn set_members(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send {
        let result = self.access(key, false, |state, key| match state.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        });
        ready(result)
    }

    fn sorted_set_add(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> impl Future<Output = Result<()>> + Send {
        let result = self.access(key, true, |state, key| {
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| new_entry(Value::SortedSet(HashMap::new())));
            let Value::SortedSet(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            members.insert(member.to_string(), score);
            Ok(())
        });
        ready(result)
    }

    fn sorted_set_remove(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        let result = self.access(key, true, |state, key| match state.entries.get_mut(key) {
            None => Ok(()),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => {
                members.remove(member);
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
        });
        ready(result)
    }

    fn sorted_set_rev_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>>> + Send {
        let result = self.access(key, false, |state, key| match state.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => {
                let mut in_range: Vec<(&String, i64)> = members
                    .iter()
                    .filter(|(_, score)| (0..=max).contains(*score))
                    .map(|(member, score)| (member, *score))
                    .collect();
                in_range.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));
                Ok(in_range
                    .into_iter()
                    .take(limit)
                    .map(|(member, _)| member.clone())
                    .collect())
            }
            Some(_) => Err(wrong_type(key)),
        });
        ready(result)
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> impl Future<Output = Result<()>> + Send {
        self.lock().writes += 1;
        let _ = self
            .notifications
            .send(Notification::new(channel, payload.to_vec()));
        ready(Ok(()))
    }

    fn subscribe(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> impl Future<Output = Result<NotificationStream>> + Send {
        let mut receiver = self.notifications.subscribe();
        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        let wanted = channels.contains(&notification.channel)
                            || patterns
                                .iter()
                                .any(|pattern| glob_matches(pattern, &notification.channel));
                        if wanted {
                            yield notification;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "In-memory subscriber lagged, notifications lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        let stream: NotificationStream = Box::pin(stream);
        ready(Ok(stream))
    }
}
