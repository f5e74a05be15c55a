//! The persisted representation of one session.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default max inactive interval: 30 minutes.
pub const DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS: i64 = 1800;

/// One session's logical fields.
///
/// A record is either fully present in the store (all three mandatory
/// fields) or absent. Attribute values are opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque, externally generated identifier.
    pub id: String,
    /// When the session was created (millisecond precision).
    pub creation_time: DateTime<Utc>,
    /// When the session was last accessed (millisecond precision).
    pub last_accessed_time: DateTime<Utc>,
    /// Inactivity window. Negative never expires, zero is already expired.
    pub max_inactive_interval: Duration,
    /// Named attribute values.
    pub attributes: HashMap<String, Vec<u8>>,
}

/// Round an interval down to whole seconds, toward negative infinity.
///
/// A negative sub-second interval stays negative (never expires) instead of
/// collapsing to zero (already expired).
#[must_use]
pub fn whole_seconds(interval: Duration) -> Duration {
    Duration::seconds(interval.num_milliseconds().div_euclid(1000))
}

impl SessionRecord {
    /// Create a fresh record with both timestamps set to `now`.
    #[must_use]
    pub fn new(id: String, now: DateTime<Utc>, max_inactive_interval: Duration) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            id,
            creation_time: now,
            last_accessed_time: now,
            max_inactive_interval: whole_seconds(max_inactive_interval),
            attributes: HashMap::new(),
        }
    }

    /// Instant at which the session expires, `None` if it never does.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.max_inactive_interval < Duration::zero() {
            return None;
        }
        Some(self.last_accessed_time + self.max_inactive_interval)
    }

    /// Whether the session is expired at `now`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, TimeZone, Utc};
    /// use ttl_session_core::SessionRecord;
    ///
    /// let t0 = Utc.timestamp_millis_opt(1_000_000).unwrap();
    /// let record = SessionRecord::new("s1".into(), t0, Duration::seconds(60));
    /// assert!(!record.is_expired(t0 + Duration::seconds(60)));
    /// assert!(record.is_expired(t0 + Duration::seconds(60) + Duration::milliseconds(1)));
    /// ```
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.max_inactive_interval == Duration::zero() {
            return true;
        }
        self.expires_at().is_some_and(|expiry| now > expiry)
    }
}
