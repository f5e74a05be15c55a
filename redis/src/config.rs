//! Repository configuration.
//!
//! Configuration values should be provided by the application; every field has
//! a default matching the conventional Spring Session layout so existing data
//! stays readable.

use crate::keys::KeyLayout;
use chrono::Duration;
use ttl_session_core::{
    DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS, FlushMode, Result, SaveMode, SessionError,
};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "spring:session";

/// Immutable configuration shared by both repository variants.
///
/// Build it once, then hand it to a repository. To change it at runtime use
/// the repository's `reconfigure`, which returns a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Key prefix. Normalized to end with exactly one `:`.
    ///
    /// Default: `spring:session`
    pub namespace: String,

    /// Database index the store connection uses. Only affects key-event
    /// channel names, so it must match the connection URL.
    ///
    /// Default: 0
    pub database: u32,

    /// Max inactive interval of newly created sessions.
    ///
    /// Default: 30 minutes
    pub default_max_inactive_interval: Duration,

    /// Which attribute accesses are persisted on save.
    ///
    /// Default: [`SaveMode::OnSetAttribute`]
    pub save_mode: SaveMode,

    /// Whether repository mutators save at once or wait for `save`.
    ///
    /// Default: [`FlushMode::OnSave`]
    pub flush_mode: FlushMode,

    /// How long a record outlives its trigger key.
    ///
    /// Default: 5 minutes
    pub grace_period: Duration,

    /// Period of the background sweep. Zero disables it.
    ///
    /// Default: 60 seconds
    pub cleanup_interval: Duration,

    /// Maximum number of sorted-index entries processed per sweep.
    ///
    /// Default: 100
    pub cleanup_batch_size: usize,
}

impl RepositoryConfig {
    /// Create configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database index.
    #[must_use]
    pub const fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Set the default max inactive interval.
    #[must_use]
    pub const fn with_default_max_inactive_interval(mut self, interval: Duration) -> Self {
        self.default_max_inactive_interval = interval;
        self
    }

    /// Set the save mode.
    #[must_use]
    pub const fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    /// Set the flush mode.
    #[must_use]
    pub const fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    /// Set the grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the sweep period.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the sweep batch size.
    #[must_use]
    pub const fn with_cleanup_batch_size(mut self, batch_size: usize) -> Self {
        self.cleanup_batch_size = batch_size;
        self
    }

    /// Load configuration from `SESSION_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if a variable does not parse or
    /// the result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(namespace) = lookup("SESSION_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(database) = parse_var(&lookup, "SESSION_DATABASE")? {
            config.database = database;
        }
        if let Some(seconds) = parse_var(&lookup, "SESSION_MAX_INACTIVE_SECONDS")? {
            config.default_max_inactive_interval = Duration::seconds(seconds);
        }
        if let Some(save_mode) = lookup("SESSION_SAVE_MODE") {
            config.save_mode = save_mode.parse().map_err(SessionError::Configuration)?;
        }
        if let Some(flush_mode) = lookup("SESSION_FLUSH_MODE") {
            config.flush_mode = flush_mode.parse().map_err(SessionError::Configuration)?;
        }
        if let Some(seconds) = parse_var(&lookup, "SESSION_GRACE_PERIOD_SECONDS")? {
            config.grace_period = Duration::seconds(seconds);
        }
        if let Some(seconds) = parse_var(&lookup, "SESSION_CLEANUP_INTERVAL_SECONDS")? {
            config.cleanup_interval = Duration::seconds(seconds);
        }
        if let Some(batch_size) = parse_var(&lookup, "SESSION_CLEANUP_BATCH_SIZE")? {
            config.cleanup_batch_size = batch_size;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the namespace is empty, the
    /// grace period or sweep period is negative, or the batch size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.normalized_namespace().is_none() {
            return Err(SessionError::Configuration(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.grace_period < Duration::zero() {
            return Err(SessionError::Configuration(
                "grace period must not be negative".to_string(),
            ));
        }
        if self.cleanup_interval < Duration::zero() {
            return Err(SessionError::Configuration(
                "cleanup interval must not be negative".to_string(),
            ));
        }
        if self.cleanup_batch_size == 0 {
            return Err(SessionError::Configuration(
                "cleanup batch size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive key names.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the configuration is invalid.
    pub fn key_layout(&self) -> Result<KeyLayout> {
        self.validate()?;
        let namespace = self.normalized_namespace().unwrap_or_default();
        Ok(KeyLayout::new(&namespace, self.database))
    }

    fn normalized_namespace(&self) -> Option<String> {
        let trimmed = self.namespace.trim().trim_end_matches(':');
        (!trimmed.is_empty()).then(|| format!("{trimmed}:"))
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: 0,
            default_max_inactive_interval: Duration::seconds(
                DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS,
            ),
            save_mode: SaveMode::default(),
            flush_mode: FlushMode::default(),
            grace_period: Duration::minutes(5),
            cleanup_interval: Duration::seconds(60),
            cleanup_batch_size: 100,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| SessionError::Configuration(format!("{name}='{raw}': {e}")))
        })
        .transpose()
}
