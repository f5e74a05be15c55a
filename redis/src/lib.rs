//! # TTL Session Redis
//!
//! Redis-backed session repositories with deterministic expiry, secondary
//! indexes and lifecycle events.
//!
//! ## Repositories
//!
//! - [`RedisSessionRepository`]: one hash per session, TTL is the expiry,
//!   strict about concurrent deletion
//! - [`IndexedSessionRepository`]: record + trigger key + expiration index,
//!   principal index, created / deleted / expired events; generic over the
//!   expiration index strategy ([`SortedIndexedSessionRepository`],
//!   [`BucketedIndexedSessionRepository`])
//! - [`blocking`]: the same repositories behind a synchronous API
//!
//! ## Background work
//!
//! [`SessionTasks`] runs the periodic expiration sweep and the notification
//! listener that turns key events into [`SessionEvent`]s. The Redis server
//! must emit generic and expired key events
//! ([`RedisKeyValueStore::configure_keyspace_notifications`]).
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use ttl_session_redis::{RepositoryConfig, SessionTasks, SortedIndexedSessionRepository};
//! use ttl_session_redis::mocks::InMemoryKeyValueStore;
//!
//! # async fn example() -> ttl_session_core::Result<()> {
//! let repository = Arc::new(SortedIndexedSessionRepository::new(
//!     InMemoryKeyValueStore::new(),
//!     RepositoryConfig::default().with_namespace("myapp"),
//! )?);
//! let tasks = SessionTasks::new(Arc::clone(&repository));
//! tasks.start().await?;
//!
//! let mut session = repository.create_session();
//! session.set_attribute("principalName", b"alice".to_vec());
//! repository.save(&mut session).await?;
//!
//! let new_id = session.change_session_id();
//! repository.save(&mut session).await?;
//! assert!(repository.find_by_id(&new_id).await?.is_some());
//!
//! tasks.stop().await;
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`SessionEvent`]: ttl_session_core::SessionEvent

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod blocking;
pub mod config;
pub mod expiration;
pub mod indexer;
pub mod keys;
pub mod metrics;
pub mod notifier;
pub mod repository;
pub mod store;
pub mod tasks;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use blocking::{BlockingIndexedSessionRepository, BlockingSessionRepository};
pub use config::{DEFAULT_NAMESPACE, RepositoryConfig};
pub use expiration::{BucketedExpirationIndex, ExpirationIndex, SortedSetExpirationIndex, TtlPlan};
pub use indexer::SessionIndexer;
pub use keys::KeyLayout;
pub use metrics::{SessionMetrics, register_metrics};
pub use notifier::{NotificationKind, classify};
pub use repository::{
    BucketedIndexedSessionRepository, IndexedSessionRepository, RedisSessionRepository,
    SortedIndexedSessionRepository,
};
pub use store::{KeyValueStore, Notification, NotificationStream, RedisKeyValueStore};
pub use tasks::SessionTasks;
