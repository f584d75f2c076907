//! Prometheus metrics for the realtime transport.
//!
//! Process-wide counters that mirror the per-client [`StatsCollector`]
//! so an embedding application can expose them on its own scrape endpoint:
//! - Connection lifecycle (connects, disconnects, reconnect attempts)
//! - Traffic (messages sent, received, dropped, malformed)
//! - Circuit breaker state and queue depth
//!
//! [`StatsCollector`]: crate::stats::StatsCollector

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, TrafficMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "dashboard_realtime";

lazy_static! {
    /// Successful handshakes
    pub static ref CONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connects_total", METRIC_PREFIX),
        "Total successful connection handshakes"
    ).unwrap();

    /// Connections lost or closed
    pub static ref DISCONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_disconnects_total", METRIC_PREFIX),
        "Total disconnects by cause",
        &["cause"]
    ).unwrap();

    /// Reconnect attempts (dials after the first)
    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnect_attempts_total", METRIC_PREFIX),
        "Total reconnection attempts"
    ).unwrap();

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();

    /// Outbound frames written
    pub static ref MESSAGES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total frames written to the transport"
    ).unwrap();

    /// Inbound frames read
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total frames read from the transport"
    ).unwrap();

    /// Messages dropped (queue eviction, paused subscription overflow)
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Total messages dropped",
        &["reason"]
    ).unwrap();

    /// Frames that failed to parse
    pub static ref MALFORMED_FRAMES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_malformed_frames_total", METRIC_PREFIX),
        "Total inbound frames dropped as malformed"
    ).unwrap();

    /// Subscriber callbacks that panicked
    pub static ref HANDLER_PANICS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_handler_panics_total", METRIC_PREFIX),
        "Total subscriber handler panics caught at dispatch"
    ).unwrap();

    /// Outbound queue depth by priority
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Queued outbound messages by priority",
        &["priority"]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTS_TOTAL.inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("dashboard_realtime_connects_total"));
    }

    #[test]
    fn test_labelled_metrics_are_exported() {
        let before = DISCONNECTS_TOTAL
            .with_label_values(&["heartbeat_timeout"])
            .get();
        ConnectionMetrics::record_disconnect("heartbeat_timeout");
        ConnectionMetrics::set_circuit_state(crate::circuit_breaker::CircuitState::HalfOpen);
        TrafficMetrics::record_dropped("queue_full");
        TrafficMetrics::set_queue_depth(crate::queue::QueueDepth {
            high: 1,
            normal: 2,
            low: 3,
        });

        assert!(
            DISCONNECTS_TOTAL
                .with_label_values(&["heartbeat_timeout"])
                .get()
                > before
        );
        let output = encode_metrics().unwrap();
        assert!(output.contains("dashboard_realtime_disconnects_total{cause=\"heartbeat_timeout\"}"));
        assert!(output.contains("dashboard_realtime_queue_depth{priority=\"low\"}"));
        assert!(output.contains("dashboard_realtime_circuit_breaker_state"));
    }
}
