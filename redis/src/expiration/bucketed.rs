//! Minute-bucketed expiration index.
//!
//! Expiry instants are rounded up to the next whole minute; each minute has a
//! set key `N expirations:<minuteMillis>` holding `expires:<id>` members. A
//! sweep processes only the bucket of the current minute (rounded down).
//!
//! This is the layout older deployments already have in Redis.

use super::ExpirationIndex;
use crate::config::RepositoryConfig;
use crate::keys::KeyLayout;
use crate::store::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use ttl_session_core::{Result, SessionRecord};

const MINUTE_MILLIS: i64 = 60_000;

/// Start of the minute after the one containing `millis`.
///
/// An instant exactly on a minute boundary still moves to the next minute.
///
/// # Examples
///
/// ```
/// use ttl_session_redis::expiration::bucketed::round_up_to_next_minute;
///
/// assert_eq!(round_up_to_next_minute(61_000), 120_000);
/// assert_eq!(round_up_to_next_minute(60_000), 120_000);
/// ```
#[must_use]
pub const fn round_up_to_next_minute(millis: i64) -> i64 {
    (millis.div_euclid(MINUTE_MILLIS) + 1) * MINUTE_MILLIS
}

/// Start of the minute containing `millis`.
#[must_use]
pub const fn round_down_to_minute(millis: i64) -> i64 {
    millis.div_euclid(MINUTE_MILLIS) * MINUTE_MILLIS
}

/// Expiration index backed by per-minute sets.
#[derive(Debug, Clone)]
pub struct BucketedExpirationIndex<S> {
    store: S,
    layout: Arc<KeyLayout>,
    grace_period: Duration,
}

impl<S: KeyValueStore> BucketedExpirationIndex<S> {
    fn bucket_of(expiry: DateTime<Utc>) -> i64 {
        round_up_to_next_minute(expiry.timestamp_millis())
    }

    async fn add_to_bucket(&self, bucket: i64, session_id: &str) -> Result<()> {
        let key = self.layout.bucket_key(bucket);
        self.store
            .set_add(&key, &KeyLayout::bucket_member(session_id))
            .await?;

        // Buckets clean themselves up if no sweep ever reaches them.
        let bucket_end =
            DateTime::<Utc>::from_timestamp_millis(bucket + MINUTE_MILLIS).unwrap_or_default();
        self.store
            .expire_at(&key, bucket_end + self.grace_period)
            .await?;
        Ok(())
    }

    async fn remove_from_bucket(&self, bucket: i64, session_id: &str) -> Result<()> {
        self.store
            .set_remove(
                &self.layout.bucket_key(bucket),
                &KeyLayout::bucket_member(session_id),
            )
            .await
    }
}

impl<S: KeyValueStore> ExpirationIndex<S> for BucketedExpirationIndex<S> {
    fn build(store: S, layout: Arc<KeyLayout>, config: &RepositoryConfig) -> Self {
        Self {
            store,
            layout,
            grace_period: config.grace_period,
        }
    }

    async fn save(
        &self,
        record: &SessionRecord,
        previous_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let new_bucket = record.expires_at().map(Self::bucket_of);
        let old_bucket = previous_expiry.map(Self::bucket_of);

        if new_bucket == old_bucket {
            return Ok(());
        }
        if let Some(old_bucket) = old_bucket {
            self.remove_from_bucket(old_bucket, &record.id).await?;
        }
        if let Some(new_bucket) = new_bucket {
            self.add_to_bucket(new_bucket, &record.id).await?;
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str, expiry: Option<DateTime<Utc>>) -> Result<()> {
        match expiry {
            Some(expiry) => {
                self.remove_from_bucket(Self::bucket_of(expiry), session_id)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn rename(
        &self,
        old_id: &str,
        new_id: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(expiry) = expiry {
            let bucket = Self::bucket_of(expiry);
            self.remove_from_bucket(bucket, old_id).await?;
            self.add_to_bucket(bucket, new_id).await?;
        }
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let bucket = round_down_to_minute(now.timestamp_millis());
        let key = self.layout.bucket_key(bucket);

        let members = self.store.set_members(&key).await?;
        self.store.delete(&key).await?;

        for member in &members {
            self.store
                .exists(&self.layout.key_for_bucket_member(member))
                .await?;
        }

        tracing::debug!(bucket, touched = members.len(), "Swept expiration bucket");
        Ok(members.len())
    }
}
