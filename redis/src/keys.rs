//! Store key and channel names.
//!
//! All names are derived once from the namespace and database index when a
//! repository is built. With namespace `N` (ending in `:`) and database `D`:
//!
//! | Purpose | Key |
//! |---|---|
//! | Record | `N sessions:<id>` |
//! | Trigger | `N sessions:expires:<id>` |
//! | Sorted expiry index | `N sessions:expirations` |
//! | Bucketed expiry index | `N expirations:<minuteMillis>` |
//! | Index membership | `N sessions:index:<name>:<value>` |
//! | Session's index set | `N sessions:<id>:idx` |
//! | Created channel | `N event:<D>:created:<id>` |

/// Member prefix of bucketed expiry sets; members are `expires:<id>`.
const BUCKET_MEMBER_PREFIX: &str = "expires:";

/// Immutable key and channel names for one namespace and database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
    database: u32,
    sessions_prefix: String,
    expires_prefix: String,
    index_prefix: String,
    created_channel_prefix: String,
}

impl KeyLayout {
    /// Derive names for `namespace` (already normalized to end with `:`).
    #[must_use]
    pub fn new(namespace: &str, database: u32) -> Self {
        let sessions_prefix = format!("{namespace}sessions:");
        Self {
            namespace: namespace.to_string(),
            database,
            expires_prefix: format!("{sessions_prefix}expires:"),
            index_prefix: format!("{sessions_prefix}index:"),
            created_channel_prefix: format!("{namespace}event:{database}:created:"),
            sessions_prefix,
        }
    }

    /// Namespace, ending with `:`.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Database index used in channel names.
    #[must_use]
    pub const fn database(&self) -> u32 {
        self.database
    }

    /// Record key.
    #[must_use]
    pub fn session_key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.sessions_prefix)
    }

    /// Trigger key.
    #[must_use]
    pub fn expires_key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.expires_prefix)
    }

    /// Prefix shared by all trigger keys.
    #[must_use]
    pub fn expires_prefix(&self) -> &str {
        &self.expires_prefix
    }

    /// Session id of a trigger key, `None` for any other key.
    ///
    /// # Examples
    ///
    /// ```
    /// use ttl_session_redis::KeyLayout;
    ///
    /// let layout = KeyLayout::new("app:", 0);
    /// assert_eq!(layout.session_id_from_expires_key("app:sessions:expires:42"), Some("42"));
    /// assert_eq!(layout.session_id_from_expires_key("app:sessions:42"), None);
    /// ```
    #[must_use]
    pub fn session_id_from_expires_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.expires_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Sorted expiry index key.
    #[must_use]
    pub fn expirations_key(&self) -> String {
        format!("{}expirations", self.sessions_prefix)
    }

    /// Bucketed expiry set for the minute starting at `bucket_millis`.
    #[must_use]
    pub fn bucket_key(&self, bucket_millis: i64) -> String {
        format!("{}expirations:{bucket_millis}", self.namespace)
    }

    /// Member of a bucketed expiry set for `session_id`.
    #[must_use]
    pub fn bucket_member(session_id: &str) -> String {
        format!("{BUCKET_MEMBER_PREFIX}{session_id}")
    }

    /// Key to touch for a bucketed expiry set member.
    #[must_use]
    pub fn key_for_bucket_member(&self, member: &str) -> String {
        format!("{}{member}", self.sessions_prefix)
    }

    /// Index membership set for one (name, value) pair.
    #[must_use]
    pub fn index_key(&self, index_name: &str, index_value: &str) -> String {
        format!("{}{index_name}:{index_value}", self.index_prefix)
    }

    /// Parse an index membership key back into (name, value).
    ///
    /// Index names never contain `:`, so the value is everything after the
    /// first separator.
    #[must_use]
    pub fn parse_index_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        key.strip_prefix(self.index_prefix.as_str())?.split_once(':')
    }

    /// Set of index membership keys a session belongs to.
    #[must_use]
    pub fn session_index_set_key(&self, session_id: &str) -> String {
        format!("{}{session_id}:idx", self.sessions_prefix)
    }

    /// Channel a new session's delta is published on.
    #[must_use]
    pub fn created_channel(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.created_channel_prefix)
    }

    /// Prefix of all created channels.
    #[must_use]
    pub fn created_channel_prefix(&self) -> &str {
        &self.created_channel_prefix
    }

    /// Pattern matching all created channels.
    #[must_use]
    pub fn created_channel_pattern(&self) -> String {
        format!("{}*", self.created_channel_prefix)
    }

    /// Native key-event channel for deletions.
    #[must_use]
    pub fn deleted_channel(&self) -> String {
        format!("__keyevent@{}__:del", self.database)
    }

    /// Native key-event channel for expirations.
    #[must_use]
    pub fn expired_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.database)
    }
}
