//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::circuit_breaker::CircuitState;
use crate::queue::QueueDepth;

use super::{
    CIRCUIT_BREAKER_STATE, CONNECTS_TOTAL, DISCONNECTS_TOTAL, HANDLER_PANICS_TOTAL,
    MALFORMED_FRAMES_TOTAL, MESSAGES_DROPPED_TOTAL, MESSAGES_RECEIVED_TOTAL, MESSAGES_SENT_TOTAL,
    QUEUE_DEPTH, RECONNECT_ATTEMPTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_connect() {
        CONNECTS_TOTAL.inc();
    }

    /// `cause` is a short label: `closed`, `error`, `heartbeat_timeout`, `manual`
    pub fn record_disconnect(cause: &str) {
        DISCONNECTS_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn record_reconnect_attempt() {
        RECONNECT_ATTEMPTS_TOTAL.inc();
    }

    pub fn set_circuit_state(state: CircuitState) {
        CIRCUIT_BREAKER_STATE.set(state as i64);
    }
}

/// Helper struct for recording traffic metrics
pub struct TrafficMetrics;

impl TrafficMetrics {
    pub fn record_sent() {
        MESSAGES_SENT_TOTAL.inc();
    }

    pub fn record_received() {
        MESSAGES_RECEIVED_TOTAL.inc();
    }

    pub fn record_dropped(reason: &str) {
        MESSAGES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_malformed() {
        MALFORMED_FRAMES_TOTAL.inc();
    }

    pub fn record_handler_panic() {
        HANDLER_PANICS_TOTAL.inc();
    }

    pub fn set_queue_depth(depth: QueueDepth) {
        QUEUE_DEPTH.with_label_values(&["high"]).set(depth.high as i64);
        QUEUE_DEPTH.with_label_values(&["normal"]).set(depth.normal as i64);
        QUEUE_DEPTH.with_label_values(&["low"]).set(depth.low as i64);
    }
}
