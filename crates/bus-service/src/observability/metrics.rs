//! Metrics definitions for the bus service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `bus_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (dispatcher, session, listener)
//! - `outcome`: bounded join outcomes (~10 values)
//! - `kind`: bounded by the event enum (8 values)
//! - `error_type`: bounded by the error enum (9 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Join negotiation spans accept policy plus transport establishment
        .set_buckets_for_metric(
            Matcher::Prefix("bus_join".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set join duration buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("bus_teardown".to_string()),
            &[0.001, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000],
        )
        .map_err(|e| format!("Failed to set teardown duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Engine Gauges
// ============================================================================

/// Metric: `bus_sessions_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_active(count: u64) {
    gauge!("bus_sessions_active").set(count as f64);
}

/// Metric: `bus_ports_bound`
#[allow(clippy::cast_precision_loss)]
pub fn set_ports_bound(count: u64) {
    gauge!("bus_ports_bound").set(count as f64);
}

/// Metric: `bus_pending_joins`
///
/// Joins currently between request and decision.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_joins(count: u64) {
    gauge!("bus_pending_joins").set(count as f64);
}

/// Metric: `bus_advertised_names`
#[allow(clippy::cast_precision_loss)]
pub fn set_advertised_names(count: u64) {
    gauge!("bus_advertised_names").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `bus_actor_mailbox_depth`
/// Labels: `actor_type` (dispatcher, session, listener)
#[allow(clippy::cast_precision_loss)]
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    gauge!("bus_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters and Histograms
// ============================================================================

/// Record a finished join negotiation.
///
/// Metrics: `bus_join_total`, `bus_join_duration_seconds`
/// Labels: `outcome` (established, declined, unregistered_port, ...)
pub fn record_join(outcome: &str, duration: Duration) {
    counter!("bus_join_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("bus_join_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `bus_events_dispatched_total`
/// Labels: `kind`
pub fn record_event_dispatched(kind: &str) {
    counter!("bus_events_dispatched_total", "kind" => kind.to_string()).increment(1);
}

/// Metric: `bus_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("bus_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Metric: `bus_errors_total`
/// Labels: `operation`, `error_type`
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "bus_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Metric: `bus_teardown_duration_seconds`
pub fn record_teardown_duration(duration: Duration) {
    histogram!("bus_teardown_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_functions_without_recorder() {
        // No recorder installed: every call is a no-op and must not panic.
        set_sessions_active(3);
        set_ports_bound(1);
        set_pending_joins(0);
        set_advertised_names(5);
        set_actor_mailbox_depth("session", 12);
        record_join("established", Duration::from_millis(5));
        record_event_dispatched("session_joined");
        record_actor_panic("listener");
        record_error("join_session", "timeout");
        record_teardown_duration(Duration::from_millis(40));
    }

    #[test]
    fn test_metrics_captured_by_debugging_recorder() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        // Scoped to this thread so parallel tests do not interfere
        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            set_ports_bound(1);
            record_join("established", Duration::from_millis(25));
            record_join("declined", Duration::from_millis(1));
            record_event_dispatched("found_advertised_name");
            record_error("bind_session_port", "port_in_use");
        });

        let metrics = snapshotter.snapshot().into_vec();
        let names: Vec<String> = metrics
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "bus_sessions_active",
            "bus_ports_bound",
            "bus_join_total",
            "bus_join_duration_seconds",
            "bus_events_dispatched_total",
            "bus_errors_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "{expected} should be recorded, got {names:?}"
            );
        }
    }
}
