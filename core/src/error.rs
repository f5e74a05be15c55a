//! Error types for session store operations.

use thiserror::Error;

/// Result type alias for session store operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error taxonomy for the session store.
///
/// Only some of these ever reach a caller. Rename races (`NoSuchKey` during id
/// rotation) and unresolvable destruction notifications are absorbed and logged
/// by the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    // ═══════════════════════════════════════════════════════════
    // Corrupt records
    // ═══════════════════════════════════════════════════════════

    /// A non-empty record is missing one of its mandatory fields.
    #[error("Session {session_id} is corrupt: missing field '{field}'")]
    MissingField {
        /// Id of the session being decoded
        session_id: String,
        /// Name of the missing field
        field: &'static str,
    },

    /// A mandatory field is present but cannot be parsed.
    #[error("Session {session_id} is corrupt: field '{field}' is malformed ({reason})")]
    MalformedField {
        /// Id of the session being decoded
        session_id: String,
        /// Name of the malformed field
        field: &'static str,
        /// Parse failure detail
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════
    // State errors
    // ═══════════════════════════════════════════════════════════

    /// The backing record vanished between load and save.
    #[error("Session {session_id} was invalidated")]
    Invalidated {
        /// Id the session was loaded under
        session_id: String,
    },

    /// Rename source key does not exist.
    #[error("No such key: {0}")]
    NoSuchKey(String),

    // ═══════════════════════════════════════════════════════════
    // System errors
    // ═══════════════════════════════════════════════════════════

    /// Transport or command failure from the underlying store.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An event publisher rejected an event.
    #[error("Failed to publish event: {0}")]
    Publish(String),
}

impl SessionError {
    /// Returns `true` if the error means a stored record is unreadable.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ttl_session_core::SessionError;
    /// let err = SessionError::MissingField { session_id: "s1".into(), field: "creationTime" };
    /// assert!(err.is_corrupt());
    /// assert!(!SessionError::StoreUnavailable("down".into()).is_corrupt());
    /// ```
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::MissingField { .. } | Self::MalformedField { .. })
    }

    /// Returns `true` if the error came from the store transport.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ttl_session_core::SessionError;
    /// assert!(SessionError::StoreUnavailable("refused".into()).is_store_failure());
    /// assert!(!SessionError::NoSuchKey("k".into()).is_store_failure());
    /// ```
    pub const fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
