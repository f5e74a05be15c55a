//! Integration tests for the indexed session repository.

#![allow(clippy::unwrap_used)]

use chrono::Duration;
use std::sync::Arc;
use ttl_session_core::{Clock, FlushMode, Session, SessionRecord};
use ttl_session_redis::mocks::InMemoryKeyValueStore;
use ttl_session_redis::{KeyValueStore, RepositoryConfig, SortedIndexedSessionRepository};
use ttl_session_testing::{ManualClock, SequentialIdGenerator};

struct Fixture {
    repository: SortedIndexedSessionRepository<InMemoryKeyValueStore>,
    store: InMemoryKeyValueStore,
    clock: ManualClock,
}

fn fixture() -> Fixture {
    let clock = ManualClock::default();
    let store = InMemoryKeyValueStore::with_clock(Arc::new(clock.clone()));
    let repository = SortedIndexedSessionRepository::new(store.clone(), RepositoryConfig::default())
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
        .with_id_generator(Arc::new(SequentialIdGenerator::default()));
    Fixture {
        repository,
        store,
        clock,
    }
}

async fn saved_session(fixture: &Fixture) -> Session {
    let mut session = fixture.repository.create_session();
    fixture.repository.save(&mut session).await.unwrap();
    session
}

async fn reload(fixture: &Fixture, session_id: &str) -> Session {
    fixture.repository.find_by_id(session_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_later_saves_keep_earlier_attributes() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("a", b"b".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    let mut found = reload(&fixture, session.id()).await;
    assert_eq!(found.attribute_names().len(), 1);
    assert_eq!(found.get_attribute("a"), Some(&b"b"[..]));

    session.set_attribute("1", b"2".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    let mut found = reload(&fixture, session.id()).await;
    assert_eq!(found.attribute_names().len(), 2);
    assert_eq!(found.get_attribute("a"), Some(&b"b"[..]));
    assert_eq!(found.get_attribute("1"), Some(&b"2"[..]));
}

#[tokio::test]
async fn test_removed_attribute_is_deleted_from_record() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("a", b"b".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    let mut loaded = reload(&fixture, session.id()).await;
    loaded.remove_attribute("a");
    fixture.repository.save(&mut loaded).await.unwrap();

    let found = reload(&fixture, session.id()).await;
    assert!(found.attribute_names().is_empty());
}

#[tokio::test]
async fn test_principal_index_follows_attribute() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    let alice = fixture.repository.find_by_principal_name("alice").await.unwrap();
    assert!(alice.contains_key(session.id()));

    session.set_attribute("principalName", b"bob".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    assert!(
        fixture
            .repository
            .find_by_principal_name("alice")
            .await
            .unwrap()
            .is_empty()
    );
    let bob = fixture.repository.find_by_principal_name("bob").await.unwrap();
    assert_eq!(bob.len(), 1);
    assert!(bob.contains_key(session.id()));

    session.remove_attribute("principalName");
    fixture.repository.save(&mut session).await.unwrap();

    assert!(
        fixture
            .repository
            .find_by_principal_name("alice")
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        fixture
            .repository
            .find_by_principal_name("bob")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_index_lookup_skips_expired_sessions() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    session.set_max_inactive_interval(Duration::seconds(60));
    fixture.repository.save(&mut session).await.unwrap();

    fixture.clock.advance(Duration::seconds(61));

    assert!(
        fixture
            .repository
            .find_by_index_name_and_value("principalName", "alice")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_only_last_rotated_id_is_persisted() {
    let fixture = fixture();
    let mut session = saved_session(&fixture).await;
    let original = session.id().to_string();

    let intermediate = session.change_session_id();
    let last = session.change_session_id();
    fixture.repository.save(&mut session).await.unwrap();

    assert!(fixture.repository.find_by_id(&original).await.unwrap().is_none());
    assert!(fixture.repository.find_by_id(&intermediate).await.unwrap().is_none());
    assert!(fixture.repository.find_by_id(&last).await.unwrap().is_some());
    assert_eq!(session.original_id(), last);
}

#[tokio::test]
async fn test_rotation_moves_every_key() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    fixture.repository.save(&mut session).await.unwrap();
    let original = session.id().to_string();

    let new_id = session.change_session_id();
    fixture.repository.save(&mut session).await.unwrap();

    let alice = fixture.repository.find_by_principal_name("alice").await.unwrap();
    assert_eq!(alice.keys().collect::<Vec<_>>(), vec![&new_id]);

    let layout = fixture.repository.key_layout();
    assert!(!fixture.store.contains_key(&layout.session_key(&original)));
    assert!(!fixture.store.contains_key(&layout.expires_key(&original)));
    assert!(!fixture.store.contains_key(&layout.session_index_set_key(&original)));
    assert!(fixture.store.contains_key(&layout.expires_key(&new_id)));
    assert_eq!(
        fixture
            .store
            .sorted_set_rev_range_by_score(&layout.expirations_key(), i64::MAX, 10)
            .await
            .unwrap(),
        vec![new_id]
    );
}

#[tokio::test]
async fn test_rotation_with_changed_attributes() {
    let fixture = fixture();
    let mut session = saved_session(&fixture).await;

    let new_id = session.change_session_id();
    session.set_attribute("cart", b"3 items".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    let mut found = reload(&fixture, &new_id).await;
    assert_eq!(found.get_attribute("cart"), Some(&b"3 items"[..]));
}

#[tokio::test]
async fn test_new_session_rotation_touches_no_old_keys() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    let original = session.id().to_string();
    let new_id = session.change_session_id();
    fixture.repository.save(&mut session).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(!fixture.store.contains_key(&layout.session_key(&original)));
    assert!(fixture.repository.find_by_id(&new_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_racing_rotations_leave_exactly_one_winner() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;
    let original = session.id().to_string();

    let mut first = reload(&fixture, &original).await;
    let mut second = reload(&fixture, &original).await;
    let first_id = first.change_session_id();
    let second_id = second.change_session_id();

    fixture.repository.save(&mut first).await.unwrap();
    fixture.repository.save(&mut second).await.unwrap();

    assert_eq!(first.id(), first_id);
    assert_eq!(second.id(), second_id);
    assert!(fixture.repository.find_by_id(&original).await.unwrap().is_none());

    let first_found = fixture.repository.find_by_id(&first_id).await.unwrap().is_some();
    let second_found = fixture.repository.find_by_id(&second_id).await.unwrap().is_some();
    assert!(first_found ^ second_found);
}

#[tokio::test]
async fn test_delete_of_unsaved_session_writes_nothing() {
    let fixture = fixture();
    let session = fixture.repository.create_session();

    let writes = fixture.store.write_count();
    fixture.repository.delete_by_id(session.id()).await.unwrap();
    assert_eq!(fixture.store.write_count(), writes);
}

#[tokio::test]
async fn test_save_without_changes_writes_nothing() {
    let fixture = fixture();
    let mut session = saved_session(&fixture).await;

    let writes = fixture.store.write_count();
    fixture.repository.save(&mut session).await.unwrap();

    let mut loaded = reload(&fixture, session.id()).await;
    fixture.repository.save(&mut loaded).await.unwrap();
    assert_eq!(fixture.store.write_count(), writes);
}

#[tokio::test]
async fn test_expiry_boundary() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_max_inactive_interval(Duration::seconds(60));
    fixture.repository.save(&mut session).await.unwrap();

    fixture.clock.advance(Duration::seconds(60));
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_some());

    fixture.clock.advance(Duration::milliseconds(1));
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ttls_of_record_and_trigger() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;
    let layout = fixture.repository.key_layout();

    assert_eq!(
        fixture.store.ttl(&layout.session_key(session.id())),
        Some(Duration::seconds(1800) + Duration::minutes(5))
    );
    assert_eq!(
        fixture.store.ttl(&layout.expires_key(session.id())),
        Some(Duration::seconds(1800))
    );
}

#[tokio::test]
async fn test_access_time_alone_refreshes_expiry() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;
    fixture.clock.advance(Duration::minutes(10));

    let mut loaded = reload(&fixture, session.id()).await;
    loaded.set_last_accessed_time(fixture.clock.now());
    fixture.repository.save(&mut loaded).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert_eq!(
        fixture.store.ttl(&layout.expires_key(session.id())),
        Some(Duration::seconds(1800))
    );

    fixture.clock.advance(Duration::minutes(25));
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_negative_interval_never_expires() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_max_inactive_interval(Duration::seconds(-1));
    fixture.repository.save(&mut session).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(fixture.store.contains_key(&layout.expires_key(session.id())));
    assert_eq!(fixture.store.ttl(&layout.session_key(session.id())), None);
    assert_eq!(fixture.store.ttl(&layout.expires_key(session.id())), None);
    assert!(
        fixture
            .store
            .sorted_set_rev_range_by_score(&layout.expirations_key(), i64::MAX, 10)
            .await
            .unwrap()
            .is_empty()
    );

    fixture.clock.advance(Duration::days(365));
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_negative_sub_second_interval_is_persistent() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;
    let mut loaded = reload(&fixture, session.id()).await;
    loaded.set_max_inactive_interval(Duration::milliseconds(-500));
    fixture.repository.save(&mut loaded).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(fixture.store.contains_key(&layout.expires_key(session.id())));
    assert_eq!(fixture.store.ttl(&layout.session_key(session.id())), None);

    fixture.clock.advance(Duration::days(30));
    let reloaded = reload(&fixture, session.id()).await;
    assert_eq!(reloaded.max_inactive_interval(), Duration::seconds(-1));
}

#[tokio::test]
async fn test_zero_interval_expires_immediately() {
    let fixture = fixture();
    let mut session = saved_session(&fixture).await;
    session.set_max_inactive_interval(Duration::zero());
    fixture.repository.save(&mut session).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_none());
    assert!(!fixture.store.contains_key(&layout.expires_key(session.id())));
    assert_eq!(
        fixture.store.ttl(&layout.session_key(session.id())),
        Some(Duration::minutes(5))
    );
}

#[tokio::test]
async fn test_already_expired_new_session_is_not_indexed() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    session.set_max_inactive_interval(Duration::zero());
    fixture.repository.save(&mut session).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(!fixture.store.contains_key(&layout.session_index_set_key(session.id())));
    assert!(!fixture.store.contains_key(&layout.index_key("principalName", "alice")));
    assert_eq!(
        fixture.store.ttl(&layout.session_key(session.id())),
        Some(Duration::minutes(5))
    );
}

#[tokio::test]
async fn test_expiring_indexed_session_drops_memberships() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    session.set_max_inactive_interval(Duration::zero());
    fixture.repository.save(&mut session).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(!fixture.store.contains_key(&layout.session_index_set_key(session.id())));
    assert!(!fixture.store.contains_key(&layout.index_key("principalName", "alice")));
}

#[tokio::test]
async fn test_delete_keeps_record_for_grace_period() {
    let fixture = fixture();
    let mut session = fixture.repository.create_session();
    session.set_attribute("principalName", b"alice".to_vec());
    fixture.repository.save(&mut session).await.unwrap();

    fixture.repository.delete_by_id(session.id()).await.unwrap();

    let layout = fixture.repository.key_layout();
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_none());
    assert!(!fixture.store.contains_key(&layout.expires_key(session.id())));
    assert!(!fixture.store.contains_key(&layout.session_index_set_key(session.id())));
    assert_eq!(
        fixture.store.ttl(&layout.session_key(session.id())),
        Some(Duration::minutes(5))
    );
    assert!(
        fixture
            .repository
            .find_by_principal_name("alice")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_save_after_concurrent_delete_is_tolerated() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;

    let mut loaded = reload(&fixture, session.id()).await;
    fixture.repository.delete_by_id(session.id()).await.unwrap();
    fixture.store.delete(&fixture.repository.key_layout().session_key(session.id())).await.unwrap();

    let writes = fixture.store.write_count();
    loaded.set_attribute("a", b"b".to_vec());
    fixture.repository.save(&mut loaded).await.unwrap();

    assert_eq!(fixture.store.write_count(), writes);
    assert!(fixture.repository.find_by_id(session.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rotation_of_vanished_session_is_tolerated() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;

    let mut loaded = reload(&fixture, session.id()).await;
    fixture.store.clear();

    let new_id = loaded.change_session_id();
    fixture.repository.save(&mut loaded).await.unwrap();

    assert_eq!(loaded.original_id(), new_id);
    assert!(fixture.repository.find_by_id(&new_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_record_is_an_error() {
    let fixture = fixture();
    let session = saved_session(&fixture).await;

    let mut fields = ttl_session_core::FieldMap::new();
    fields.insert(
        "creationTime".to_string(),
        ttl_session_core::FieldValue::Tombstone,
    );
    let key = fixture.repository.key_layout().session_key(session.id());
    fixture.store.hash_apply(&key, &fields).await.unwrap();

    let result = fixture.repository.find_by_id(session.id()).await;
    assert!(result.unwrap_err().is_corrupt());
}

#[tokio::test]
async fn test_reconfigure_uses_new_namespace() {
    let fixture = fixture();
    let other = fixture
        .repository
        .reconfigure(RepositoryConfig::default().with_namespace("other"))
        .unwrap();

    let session = saved_session(&fixture).await;
    assert!(other.find_by_id(session.id()).await.unwrap().is_none());
    assert_eq!(other.key_layout().namespace(), "other:");

    let record: SessionRecord = reload(&fixture, session.id()).await.into_record();
    assert_eq!(record.id, session.id());
}

#[tokio::test]
async fn test_immediate_flush_mode_writes_every_mutation() {
    let fixture = fixture();
    let repository = fixture
        .repository
        .reconfigure(RepositoryConfig::default().with_flush_mode(FlushMode::Immediate))
        .unwrap();
    let layout = repository.key_layout().clone();

    let mut session = repository.open_session().await.unwrap();
    assert!(fixture.store.contains_key(&layout.session_key(session.id())));
    assert!(fixture.store.contains_key(&layout.expires_key(session.id())));

    repository
        .set_attribute(&mut session, "principalName", b"alice".to_vec())
        .await
        .unwrap();
    let alice = repository.find_by_principal_name("alice").await.unwrap();
    assert!(alice.contains_key(session.id()));

    repository
        .set_max_inactive_interval(&mut session, Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(
        fixture.store.ttl(&layout.expires_key(session.id())),
        Some(Duration::seconds(60))
    );

    repository
        .remove_attribute(&mut session, "principalName")
        .await
        .unwrap();
    assert!(repository.find_by_principal_name("alice").await.unwrap().is_empty());
    assert!(session.delta().is_empty());
}

#[tokio::test]
async fn test_on_save_flush_mode_defers_mutations() {
    let fixture = fixture();
    let mut session = fixture.repository.open_session().await.unwrap();
    fixture
        .repository
        .set_attribute(&mut session, "principalName", b"alice".to_vec())
        .await
        .unwrap();

    assert_eq!(fixture.store.write_count(), 0);
    fixture.repository.save(&mut session).await.unwrap();
    assert_eq!(
        fixture.repository.find_by_principal_name("alice").await.unwrap().len(),
        1
    );
}
