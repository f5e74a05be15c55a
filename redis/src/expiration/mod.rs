//! Expiration engine.
//!
//! Each persisted session carries three pieces of expiry bookkeeping:
//!
//! - the record key's own TTL, pushed past the logical expiry by a grace period
//! - a trigger key whose TTL is the true inactivity window
//! - an entry in an [`ExpirationIndex`], swept periodically so expiry does not
//!   depend on the store's lazy expiry cycle
//!
//! [`TtlPlan`] decides the first two; the index strategies live in
//! [`sorted`] and [`bucketed`].

pub mod bucketed;
pub mod sorted;

pub use bucketed::BucketedExpirationIndex;
pub use sorted::SortedSetExpirationIndex;

use crate::config::RepositoryConfig;
use crate::keys::KeyLayout;
use crate::store::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use ttl_session_core::{Result, SessionRecord};

/// TTL bookkeeping for one save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPlan {
    /// Negative interval: record and trigger never expire.
    Persist,
    /// Zero interval: drop the trigger now, keep the record readable for the
    /// grace period.
    ExpireNow {
        /// TTL left on the record.
        record_ttl: Duration,
    },
    /// Positive interval.
    Expire {
        /// Interval plus grace period.
        record_ttl: Duration,
        /// Exactly the interval.
        trigger_ttl: Duration,
    },
}

impl TtlPlan {
    /// Plan TTLs for `interval` with `grace_period`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Duration;
    /// use ttl_session_redis::expiration::TtlPlan;
    ///
    /// let plan = TtlPlan::for_interval(Duration::seconds(1800), Duration::minutes(5));
    /// assert_eq!(
    ///     plan,
    ///     TtlPlan::Expire {
    ///         record_ttl: Duration::seconds(2100),
    ///         trigger_ttl: Duration::seconds(1800),
    ///     }
    /// );
    /// ```
    #[must_use]
    pub fn for_interval(interval: Duration, grace_period: Duration) -> Self {
        if interval < Duration::zero() {
            Self::Persist
        } else if interval == Duration::zero() {
            Self::ExpireNow {
                record_ttl: grace_period,
            }
        } else {
            Self::Expire {
                record_ttl: interval + grace_period,
                trigger_ttl: interval,
            }
        }
    }
}

/// Apply `plan` to a session's record and trigger keys.
pub(crate) async fn apply_ttl_plan<S: KeyValueStore>(
    store: &S,
    layout: &KeyLayout,
    session_id: &str,
    plan: TtlPlan,
) -> Result<()> {
    let session_key = layout.session_key(session_id);
    let expires_key = layout.expires_key(session_id);

    match plan {
        TtlPlan::Persist => {
            store.append_empty(&expires_key).await?;
            store.persist(&expires_key).await?;
            store.persist(&session_key).await?;
        }
        TtlPlan::ExpireNow { record_ttl } => {
            store.delete(&expires_key).await?;
            store.expire(&session_key, record_ttl).await?;
        }
        TtlPlan::Expire {
            record_ttl,
            trigger_ttl,
        } => {
            store.expire(&session_key, record_ttl).await?;
            store.append_empty(&expires_key).await?;
            store.expire(&expires_key, trigger_ttl).await?;
        }
    }
    Ok(())
}

/// Time-ordered index of session expiries, swept to force cleanup.
///
/// An entry exists iff the session's record exists with a non-negative
/// interval. Changing the expiry replaces the entry.
pub trait ExpirationIndex<S: KeyValueStore>: Send + Sync + Sized + 'static {
    /// Build the index for a store and key layout.
    fn build(store: S, layout: Arc<KeyLayout>, config: &RepositoryConfig) -> Self;

    /// Record the current expiry of `record`, replacing the entry for
    /// `previous_expiry` if there was one.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn save(
        &self,
        record: &SessionRecord,
        previous_expiry: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove the entry of `session_id`, which expires at `expiry`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn remove(
        &self,
        session_id: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Move the entry of `old_id` to `new_id`, keeping `expiry`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn rename(
        &self,
        old_id: &str,
        new_id: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Touch the trigger keys of sessions due at `now`.
    ///
    /// Returns the number of keys touched.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    fn cleanup(&self, now: DateTime<Utc>) -> impl Future<Output = Result<usize>> + Send;
}
