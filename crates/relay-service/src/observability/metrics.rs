//! Metrics definitions for the signaling relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `kind`: 7 values (signaling message kinds)
//! - `reason`: bounded by `DropReason` plus decode failures (~10 values)
//!
//! User ids never appear in labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle for serving
/// `/metrics`.
///
/// Must be called before any metrics are recorded. Routing is an in-memory
/// hop, so latency buckets start in the tens of microseconds.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("relay_route".to_string()),
            &[
                0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.005, 0.010, 0.050, 0.100,
            ],
        )
        .map_err(|e| format!("Failed to set route latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `relay_connections_active`
///
/// Open WebSocket connections, registered or not.
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Metric: `relay_online_users`
pub fn set_online_users(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_online_users").set(count as f64);
}

/// Metric: `relay_pairings_active`
pub fn set_pairings_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_pairings_active").set(count as f64);
}

/// Metric: `relay_mailbox_depth`
///
/// Relay actor backlog. Sustained growth means routing is falling behind.
pub fn set_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_mailbox_depth").set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `relay_messages_routed_total`
/// Labels: `kind`
pub fn record_message_routed(kind: &'static str) {
    counter!("relay_messages_routed_total", "kind" => kind).increment(1);
}

/// Metric: `relay_messages_dropped_total`
/// Labels: `reason`
pub fn record_message_dropped(reason: &'static str) {
    counter!("relay_messages_dropped_total", "reason" => reason).increment(1);
}

/// Metric: `relay_invite_replies_total`
/// Labels: `outcome` (unreachable, busy)
pub fn record_invite_reply(outcome: &'static str) {
    counter!("relay_invite_replies_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Metric: `relay_route_latency_seconds`
/// Labels: `kind`
///
/// Time from the relay actor picking up a message to it being handed to the
/// target channel (or dropped).
pub fn record_route_latency(kind: &'static str, duration: Duration) {
    histogram!("relay_route_latency_seconds", "kind" => kind).record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::MetricKind;

    #[test]
    fn test_gauges_without_recorder() {
        // No recorder installed: calls go to the global no-op recorder.
        set_connections_active(0);
        set_connections_active(42);
        set_online_users(10);
        set_pairings_active(3);
        set_mailbox_depth(7);
    }

    #[test]
    fn test_routed_and_dropped_counters_are_labeled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_message_routed("invite");
            record_message_routed("invite");
            record_message_dropped("stale_peer");
            record_route_latency("invite", Duration::from_micros(80));
        });

        let snapshot = snapshotter.snapshot().into_vec();

        let routed = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.kind() == MetricKind::Counter
                    && key.key().name() == "relay_messages_routed_total"
            })
            .expect("routed counter recorded");
        assert!(routed
            .0
            .key()
            .labels()
            .any(|l| l.key() == "kind" && l.value() == "invite"));
        assert_eq!(routed.3, DebugValue::Counter(2));

        let dropped = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "relay_messages_dropped_total")
            .expect("dropped counter recorded");
        assert!(dropped
            .0
            .key()
            .labels()
            .any(|l| l.key() == "reason" && l.value() == "stale_peer"));

        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram
                && key.key().name() == "relay_route_latency_seconds"));
    }

    #[test]
    fn test_invite_reply_counter() {
        record_invite_reply("unreachable");
        record_invite_reply("busy");
    }
}
