//! Metrics for the session engine.
//!
//! Counters are recorded through the `metrics` facade; install any recorder
//! (the sweeper binary installs the Prometheus exporter) to collect them.
//! Without a recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Register all metric descriptions.
///
/// Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!(
        "session_saves_total",
        "Total number of session saves that wrote to the store"
    );
    describe_counter!(
        "sessions_created_total",
        "Total number of new sessions persisted"
    );
    describe_counter!(
        "sessions_deleted_total",
        "Total number of sessions deleted by id"
    );
    describe_counter!(
        "session_id_rotations_total",
        "Total number of session id changes applied to the store"
    );
    describe_counter!(
        "session_events_published_total",
        "Total number of lifecycle events handed to the publisher"
    );
    describe_counter!(
        "session_cleanup_touched_total",
        "Total number of keys touched by expiration sweeps"
    );
    describe_counter!(
        "session_cleanup_ticks_skipped_total",
        "Total number of sweep ticks dropped because a sweep was still running"
    );
    describe_counter!(
        "session_notifications_unresolvable_total",
        "Total number of destruction notifications whose session could not be loaded"
    );
    describe_histogram!(
        "session_cleanup_duration_seconds",
        "Time taken by one expiration sweep"
    );
}

/// Session metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a save that wrote to the store.
    pub fn record_save(created: bool) {
        counter!("session_saves_total").increment(1);
        if created {
            counter!("sessions_created_total").increment(1);
        }
    }

    /// Record a delete by id.
    pub fn record_delete() {
        counter!("sessions_deleted_total").increment(1);
    }

    /// Record an id rotation.
    pub fn record_rotation() {
        counter!("session_id_rotations_total").increment(1);
    }

    /// Record a published event.
    pub fn record_event_published(kind: &'static str) {
        counter!("session_events_published_total", "kind" => kind).increment(1);
    }

    /// Record a finished sweep.
    pub fn record_cleanup(touched: usize, duration: Duration) {
        counter!("session_cleanup_touched_total").increment(touched as u64);
        histogram!("session_cleanup_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a dropped sweep tick.
    pub fn record_cleanup_skipped() {
        counter!("session_cleanup_ticks_skipped_total").increment(1);
    }

    /// Record a notification whose session was already gone.
    pub fn record_unresolvable_notification() {
        counter!("session_notifications_unresolvable_total").increment(1);
    }
}
