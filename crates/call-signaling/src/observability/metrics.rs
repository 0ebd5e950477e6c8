//! Metric definitions for the call signaling engine.
//!
//! Naming follows Prometheus conventions:
//! - `signaling_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label is bounded by code:
//! - `kind`: 4 values (offer, answer, ice, hangup)
//! - `status`: 2 values (success, error)
//! - `source`: 2 values (push, replay) or (push, poll)
//! - `mode`: 2 values (initiator, responder)
//! - `reason`: 5 values (local_hangup, remote_hangup, connection_lost, cancelled,
//!   session_ended)
//! - `operation`: bounded by store methods (~10 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime, before any metric is
/// recorded. Store latency buckets match database query expectations.
///
/// # Errors
///
/// Returns an error if the recorder or listener cannot be installed.
pub fn init_metrics_recorder(bind_address: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(bind_address)
        .set_buckets_for_metric(
            Matcher::Prefix("signaling_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Signal Metrics (Counters)
// ============================================================================

/// Record a signal publish attempt.
///
/// Metric: `signaling_signals_published_total`
/// Labels: `kind`, `status` (success, error)
pub fn record_signal_published(kind: &str, status: &str) {
    counter!("signaling_signals_published_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a remote signal applied by a controller.
///
/// Metric: `signaling_signals_received_total`
/// Labels: `kind`, `source` (push, replay)
pub fn record_signal_received(kind: &str, source: &str) {
    counter!("signaling_signals_received_total",
        "kind" => kind.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a redelivered signal that was skipped.
///
/// Metric: `signaling_signals_duplicate_total`
/// Labels: `kind`
///
/// Expected to be non-zero: replay overlaps with push delivery on every
/// subscription.
pub fn record_signal_duplicate(kind: &str) {
    counter!("signaling_signals_duplicate_total", "kind" => kind.to_string()).increment(1);
}

/// Record a signal dropped because its payload could not be used.
///
/// Metric: `signaling_signals_malformed_total`
/// Labels: `kind`
///
/// Non-zero values point at a peer writing incompatible payloads.
pub fn record_signal_malformed(kind: &str) {
    counter!("signaling_signals_malformed_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Call Attempt Metrics
// ============================================================================

/// Record a call attempt starting.
///
/// Metrics: `signaling_call_attempts_total` (labels: `mode`),
/// `signaling_call_attempts_active` (gauge, incremented)
pub fn record_call_attempt_started(mode: &str) {
    counter!("signaling_call_attempts_total", "mode" => mode.to_string()).increment(1);
    gauge!("signaling_call_attempts_active").increment(1.0);
}

/// Record a call attempt finishing.
///
/// Metrics: `signaling_calls_ended_total` (labels: `reason`),
/// `signaling_call_attempts_active` (gauge, decremented)
pub fn record_call_ended(reason: &str) {
    counter!("signaling_calls_ended_total", "reason" => reason.to_string()).increment(1);
    gauge!("signaling_call_attempts_active").decrement(1.0);
}

/// Record how a responder discovered a call.
///
/// Metric: `signaling_join_discoveries_total`
/// Labels: `source` (push, poll)
pub fn record_join_discovery(source: &str) {
    counter!("signaling_join_discoveries_total", "source" => source.to_string()).increment(1);
}

// ============================================================================
// Store Metrics
// ============================================================================

/// Record store operation latency.
///
/// Metric: `signaling_store_operation_duration_seconds`
/// Labels: `operation`, `status`
pub fn record_store_operation(operation: &str, status: &str, duration: Duration) {
    histogram!("signaling_store_operation_duration_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record sessions ended by the stale session sweeper.
///
/// Metric: `signaling_sessions_swept_total`
pub fn record_sessions_swept(count: u64) {
    counter!("signaling_sessions_swept_total").increment(count);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_metric_names_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_signal_published("offer", "success");
            record_signal_received("answer", "push");
            record_signal_duplicate("ice");
            record_signal_malformed("ice");
            record_call_attempt_started("initiator");
            record_call_ended("local_hangup");
            record_join_discovery("poll");
            record_store_operation("insert_signal", "success", Duration::from_millis(3));
            record_sessions_swept(2);
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "signaling_signals_published_total",
            "signaling_signals_received_total",
            "signaling_signals_duplicate_total",
            "signaling_signals_malformed_total",
            "signaling_call_attempts_total",
            "signaling_call_attempts_active",
            "signaling_calls_ended_total",
            "signaling_join_discoveries_total",
            "signaling_store_operation_duration_seconds",
            "signaling_sessions_swept_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}"
            );
        }
    }

    #[test]
    fn test_active_attempts_gauge_balances() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_call_attempt_started("initiator");
            record_call_attempt_started("responder");
            record_call_ended("remote_hangup");
        });

        let active = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "signaling_call_attempts_active")
            .map(|(_, _, _, value)| value);

        assert!(
            matches!(active, Some(DebugValue::Gauge(v)) if (v.into_inner() - 1.0).abs() < f64::EPSILON),
            "expected one active attempt, got {active:?}"
        );
    }

    #[test]
    fn test_sessions_swept_counts_rows() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_sessions_swept(3);
            record_sessions_swept(4);
        });

        let swept = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "signaling_sessions_swept_total")
            .map(|(_, _, _, value)| value);

        assert_eq!(swept, Some(DebugValue::Counter(7)));
    }
}
