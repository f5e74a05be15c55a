//! # TTL Session Core
//!
//! Pure building blocks of the TTL-backed session store. Nothing in this
//! crate performs I/O; the engine in `ttl-session-redis` drives a key/value
//! store with them.
//!
//! ## Concepts
//!
//! - **Record**: the persisted fields of one session ([`SessionRecord`])
//! - **Codec**: record ↔ flat field map ([`codec`])
//! - **Facade**: a loaded record plus a delta of changed fields ([`Session`])
//! - **Save mode**: which accesses dirty the delta ([`SaveMode`])
//! - **Index resolver**: attribute-derived (name, value) pairs ([`IndexResolver`])
//! - **Events**: created / deleted / expired notifications ([`SessionEvent`])
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use ttl_session_core::{SaveMode, Session, environment::UuidSessionIdGenerator};
//!
//! let mut session = Session::create(
//!     Arc::new(UuidSessionIdGenerator),
//!     Utc::now(),
//!     Duration::seconds(1800),
//!     SaveMode::default(),
//! );
//! session.set_attribute("cart", b"3 items".to_vec());
//! assert_eq!(session.delta().len(), 4);
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod codec;
pub mod environment;
pub mod error;
pub mod event;
pub mod index;
pub mod record;
pub mod session;

// Re-export main types for convenience
pub use codec::{FieldMap, FieldValue};
pub use environment::{Clock, SessionIdGenerator, SystemClock, UuidSessionIdGenerator};
pub use error::{Result, SessionError};
pub use event::{
    BroadcastEventPublisher, NoopEventPublisher, SessionEvent, SessionEventKind,
    SessionEventPublisher,
};
pub use index::{
    DelegatingIndexResolver, IndexResolver, PRINCIPAL_NAME_INDEX_NAME,
    PrincipalNameIndexResolver, SECURITY_CONTEXT_ATTRIBUTE,
};
pub use record::{DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS, SessionRecord, whole_seconds};
pub use session::{FlushMode, SaveMode, Session};
