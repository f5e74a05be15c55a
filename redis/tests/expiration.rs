//! Integration tests for the two expiration index strategies.

#![allow(clippy::unwrap_used)]

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use ttl_session_core::{Clock, Session, SessionEventKind};
use ttl_session_redis::mocks::InMemoryKeyValueStore;
use ttl_session_redis::{
    ExpirationIndex, IndexedSessionRepository, KeyLayout, KeyValueStore, RepositoryConfig,
    SessionTasks,
};
use ttl_session_testing::{ManualClock, RecordingEventPublisher, SequentialIdGenerator};

struct Fixture<X> {
    repository: Arc<IndexedSessionRepository<InMemoryKeyValueStore, X>>,
    store: InMemoryKeyValueStore,
    clock: ManualClock,
    events: RecordingEventPublisher,
}

fn fixture<X>(config: RepositoryConfig) -> Fixture<X>
where
    X: ExpirationIndex<InMemoryKeyValueStore>,
{
    let clock = ManualClock::default();
    let store = InMemoryKeyValueStore::with_clock(Arc::new(clock.clone()));
    let events = RecordingEventPublisher::new();
    let repository = IndexedSessionRepository::new(
        store.clone(),
        config.with_cleanup_interval(Duration::zero()),
    )
    .unwrap()
    .with_clock(Arc::new(clock.clone()))
    .with_id_generator(Arc::new(SequentialIdGenerator::default()))
    .with_event_publisher(Arc::new(events.clone()));
    Fixture {
        repository: Arc::new(repository),
        store,
        clock,
        events,
    }
}

async fn save_with_interval<X>(fixture: &Fixture<X>, seconds: i64) -> Session
where
    X: ExpirationIndex<InMemoryKeyValueStore>,
{
    let mut session = fixture.repository.create_session();
    session.set_max_inactive_interval(Duration::seconds(seconds));
    fixture.repository.save(&mut session).await.unwrap();
    session
}

fn millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

mod bucketed {
    use super::*;

    type Index = ttl_session_redis::BucketedExpirationIndex<InMemoryKeyValueStore>;

    fn bucketed() -> Fixture<Index> {
        fixture(RepositoryConfig::default())
    }

    #[tokio::test]
    async fn test_session_lands_in_next_minute_bucket() {
        let fixture = bucketed();
        let start = fixture.clock.now();
        let session = save_with_interval(&fixture, 60).await;

        // Expiry falls exactly on a minute boundary and still moves on.
        let bucket = millis(start) + 120_000;
        let key = fixture.repository.key_layout().bucket_key(bucket);
        assert_eq!(
            fixture.store.set_members(&key).await.unwrap(),
            vec![KeyLayout::bucket_member(session.id())]
        );
    }

    #[tokio::test]
    async fn test_same_bucket_update_does_not_touch_index() {
        let fixture = bucketed();
        let session = save_with_interval(&fixture, 60).await;

        fixture.clock.advance(Duration::seconds(1));
        let mut loaded = fixture.repository.find_by_id(session.id()).await.unwrap().unwrap();
        loaded.set_last_accessed_time(fixture.clock.now());

        let bucket_keys = |fixture: &Fixture<Index>| {
            fixture
                .store
                .keys()
                .into_iter()
                .filter(|key| key.contains("expirations:"))
                .collect::<Vec<_>>()
        };
        let before = bucket_keys(&fixture);
        fixture.repository.save(&mut loaded).await.unwrap();
        assert_eq!(bucket_keys(&fixture), before);
    }

    #[tokio::test]
    async fn test_moved_expiry_leaves_old_bucket() {
        let fixture = bucketed();
        let start = fixture.clock.now();
        let session = save_with_interval(&fixture, 120).await;

        fixture.clock.advance(Duration::seconds(90));
        let mut loaded = fixture.repository.find_by_id(session.id()).await.unwrap().unwrap();
        loaded.set_last_accessed_time(fixture.clock.now());
        fixture.repository.save(&mut loaded).await.unwrap();

        let layout = fixture.repository.key_layout();
        assert!(!fixture.store.contains_key(&layout.bucket_key(millis(start) + 180_000)));
        assert_eq!(
            fixture
                .store
                .set_members(&layout.bucket_key(millis(start) + 240_000))
                .await
                .unwrap(),
            vec![KeyLayout::bucket_member(session.id())]
        );
    }

    #[tokio::test]
    async fn test_sweep_of_current_minute_expires_session() {
        let fixture = bucketed();
        let tasks = SessionTasks::new(Arc::clone(&fixture.repository));
        tasks.start().await.unwrap();

        let session = save_with_interval(&fixture, 60).await;

        // Too early: the bucket of the current minute is empty.
        fixture.clock.advance(Duration::seconds(61));
        assert_eq!(fixture.repository.cleanup_expired_sessions().await.unwrap(), 0);

        fixture.clock.advance(Duration::seconds(59));
        assert_eq!(fixture.repository.cleanup_expired_sessions().await.unwrap(), 1);
        assert!(
            fixture
                .events
                .wait_for(SessionEventKind::Expired, session.id(), StdDuration::from_secs(2))
                .await
                .is_some()
        );

        tasks.stop().await;
    }

    #[tokio::test]
    async fn test_persistent_session_is_not_bucketed() {
        let fixture = bucketed();
        save_with_interval(&fixture, -1).await;

        assert!(
            fixture
                .store
                .keys()
                .iter()
                .all(|key| !key.contains("expirations:"))
        );
    }
}

mod sorted {
    use super::*;

    type Index = ttl_session_redis::SortedSetExpirationIndex<InMemoryKeyValueStore>;

    fn sorted(config: RepositoryConfig) -> Fixture<Index> {
        fixture(config)
    }

    #[tokio::test]
    async fn test_entry_scored_by_expiry() {
        let fixture = sorted(RepositoryConfig::default());
        let start = fixture.clock.now();
        let session = save_with_interval(&fixture, 60).await;

        let key = fixture.repository.key_layout().expirations_key();
        let expiry = millis(start) + 60_000;
        assert_eq!(
            fixture
                .store
                .sorted_set_rev_range_by_score(&key, expiry, 10)
                .await
                .unwrap(),
            vec![session.id().to_string()]
        );
        assert!(
            fixture
                .store
                .sorted_set_rev_range_by_score(&key, expiry - 1, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size() {
        let fixture = sorted(RepositoryConfig::default().with_cleanup_batch_size(2));
        for _ in 0..3 {
            save_with_interval(&fixture, 60).await;
        }

        fixture.clock.advance(Duration::seconds(61));
        assert_eq!(fixture.repository.cleanup_expired_sessions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_ignores_entries_not_yet_due() {
        let fixture = sorted(RepositoryConfig::default());
        save_with_interval(&fixture, 60).await;

        fixture.clock.advance(Duration::seconds(59));
        assert_eq!(fixture.repository.cleanup_expired_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_entries_of_vanished_sessions() {
        let fixture = sorted(RepositoryConfig::default());
        let session = save_with_interval(&fixture, 60).await;

        let layout = fixture.repository.key_layout();
        fixture.store.delete(&layout.session_key(session.id())).await.unwrap();
        fixture.store.delete(&layout.expires_key(session.id())).await.unwrap();

        fixture.clock.advance(Duration::seconds(61));
        assert_eq!(fixture.repository.cleanup_expired_sessions().await.unwrap(), 0);
        assert!(!fixture.store.contains_key(&layout.expirations_key()));
    }
}
