//! # TTL Session Testing
//!
//! Test doubles for the capabilities the session store consumes.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Predictable session ids ([`SequentialIdGenerator`])
//! - An event sink that remembers everything ([`RecordingEventPublisher`])
//! - One-line tracing setup for tests ([`init_test_tracing`])
//!
//! ## Example
//!
//! ```
//! use chrono::Duration;
//! use ttl_session_core::Clock;
//! use ttl_session_testing::{ManualClock, test_clock};
//!
//! let clock = ManualClock::new(test_clock().now());
//! let before = clock.now();
//! clock.advance(Duration::minutes(31));
//! assert_eq!(clock.now() - before, Duration::minutes(31));
//! ```

use chrono::{DateTime, Duration, Utc};
use ttl_session_core::environment::{Clock, SessionIdGenerator};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Duration, SessionIdGenerator, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration as StdDuration;
    use ttl_session_core::{Result, SessionEvent, SessionEventKind, SessionEventPublisher};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ttl_session_testing::mocks::FixedClock;
    /// use ttl_session_core::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default(),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a store and a repository can observe
    /// one timeline.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move forward (or backward, with a negative duration).
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Generates `{prefix}-1`, `{prefix}-2`, ...
    #[derive(Debug, Clone)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: Arc<AtomicUsize>,
    }

    impl SequentialIdGenerator {
        /// Create a generator with the given prefix.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: Arc::new(AtomicUsize::new(1)),
            }
        }
    }

    impl Default for SequentialIdGenerator {
        fn default() -> Self {
            Self::new("session")
        }
    }

    impl SessionIdGenerator for SequentialIdGenerator {
        fn generate(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{}-{n}", self.prefix)
        }
    }

    /// Captures published events.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingEventPublisher {
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl RecordingEventPublisher {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of everything published so far.
        #[must_use]
        pub fn events(&self) -> Vec<SessionEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Events of one kind.
        #[must_use]
        pub fn events_of(&self, kind: SessionEventKind) -> Vec<SessionEvent> {
            self.events()
                .into_iter()
                .filter(|event| event.kind == kind)
                .collect()
        }

        /// Forget recorded events.
        pub fn clear(&self) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// Poll until an event of `kind` for `session_id` shows up.
        ///
        /// Returns `None` after `timeout`.
        pub async fn wait_for(
            &self,
            kind: SessionEventKind,
            session_id: &str,
            timeout: StdDuration,
        ) -> Option<SessionEvent> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(event) = self
                    .events()
                    .into_iter()
                    .find(|e| e.kind == kind && e.session.id == session_id)
                {
                    return Some(event);
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        }
    }

    impl SessionEventPublisher for RecordingEventPublisher {
        fn publish(&self, event: SessionEvent) -> Result<()> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
            Ok(())
        }
    }
}

/// Install a test-writer tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ttl_session=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{
    FixedClock, ManualClock, RecordingEventPublisher, SequentialIdGenerator, test_clock,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let shared = clock.clone();
        clock.advance(Duration::seconds(90));
        assert_eq!(shared.now(), test_clock().now() + Duration::seconds(90));
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("s");
        assert_eq!(ids.generate(), "s-1");
        assert_eq!(ids.generate(), "s-2");
    }
}
