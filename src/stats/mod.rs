//! Passive counters read by the UI and by tests.
//!
//! Counters are atomics so handlers and pollers can read them from any
//! thread; the connection task is the only writer of the gauge-like fields.
//! Every update is mirrored into the process-wide Prometheus registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use crate::connection::ConnectionState;
use crate::metrics::{ConnectionMetrics, TrafficMetrics};
use crate::queue::QueueDepth;

/// Why a message was dropped, used as the metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted from a full outbound queue bucket
    QueueFull,
    /// Exceeded its write retries during a drain
    SendRetries,
    /// Arrived for a paused subscription that does not buffer, or overflowed its buffer
    Paused,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::SendRetries => "send_retries",
            DropReason::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Gauges {
    state: ConnectionState,
    degraded: bool,
    online: bool,
    queue_depth: QueueDepth,
    circuit: CircuitBreakerStats,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the collector
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub state: ConnectionState,
    pub degraded: bool,
    pub online: bool,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub malformed_frames: u64,
    pub handler_panics: u64,
    pub queue_depth: QueueDepth,
    pub circuit_state: CircuitState,
    pub circuit_failure_count: u32,
    pub circuit_open_cycles: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Channels currently in the registry
    pub subscriptions: usize,
}

pub struct StatsCollector {
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    malformed_frames: AtomicU64,
    handler_panics: AtomicU64,
    gauges: Mutex<Gauges>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            gauges: Mutex::new(Gauges {
                state: ConnectionState::Disconnected,
                degraded: false,
                online: true,
                queue_depth: QueueDepth::default(),
                circuit: CircuitBreakerStats {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    open_cycles: 0,
                },
                last_heartbeat_at: None,
            }),
        }
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_connect();
    }

    pub fn record_disconnect(&self, cause: &str) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_disconnect(cause);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        ConnectionMetrics::record_reconnect_attempt();
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        TrafficMetrics::record_sent();
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        TrafficMetrics::record_received();
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        TrafficMetrics::record_dropped(reason.as_str());
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
        TrafficMetrics::record_malformed();
    }

    pub fn record_handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
        TrafficMetrics::record_handler_panic();
    }

    pub fn set_state(&self, state: ConnectionState, degraded: bool) {
        self.with_gauges(|g| {
            g.state = state;
            g.degraded = degraded;
        });
    }

    pub fn set_online(&self, online: bool) {
        self.with_gauges(|g| g.online = online);
    }

    pub fn set_queue_depth(&self, depth: QueueDepth) {
        self.with_gauges(|g| g.queue_depth = depth);
        TrafficMetrics::set_queue_depth(depth);
    }

    pub fn set_circuit(&self, circuit: CircuitBreakerStats) {
        self.with_gauges(|g| g.circuit = circuit);
        ConnectionMetrics::set_circuit_state(circuit.state);
    }

    pub fn touch_heartbeat(&self) {
        self.with_gauges(|g| g.last_heartbeat_at = Some(Utc::now()));
    }

    pub fn snapshot(&self, subscriptions: usize) -> StatsSnapshot {
        let gauges = match self.gauges.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };

        StatsSnapshot {
            state: gauges.state,
            degraded: gauges.degraded,
            online: gauges.online,
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            queue_depth: gauges.queue_depth,
            circuit_state: gauges.circuit.state,
            circuit_failure_count: gauges.circuit.failure_count,
            circuit_open_cycles: gauges.circuit.open_cycles,
            last_heartbeat_at: gauges.last_heartbeat_at,
            subscriptions,
        }
    }

    fn with_gauges(&self, f: impl FnOnce(&mut Gauges)) {
        match self.gauges.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StatsCollector::new();
        stats.record_connect();
        stats.record_disconnect("closed");
        stats.record_reconnect_attempt();
        stats.record_reconnect_attempt();
        stats.record_sent();
        stats.record_received();
        stats.record_dropped(DropReason::QueueFull);
        stats.record_malformed();

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.connects, 1);
        assert_eq!(snapshot.disconnects, 1);
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.malformed_frames, 1);
        assert_eq!(snapshot.subscriptions, 2);
    }

    #[test]
    fn test_gauges_reflect_latest_values() {
        let stats = StatsCollector::new();
        assert!(stats.snapshot(0).online);
        assert!(stats.snapshot(0).last_heartbeat_at.is_none());

        stats.set_online(false);
        stats.set_state(ConnectionState::Connecting, false);
        stats.set_queue_depth(QueueDepth {
            high: 1,
            normal: 0,
            low: 4,
        });
        stats.set_circuit(CircuitBreakerStats {
            state: CircuitState::Open,
            failure_count: 3,
            open_cycles: 1,
        });
        stats.touch_heartbeat();

        let snapshot = stats.snapshot(0);
        assert!(!snapshot.online);
        assert_eq!(snapshot.state, ConnectionState::Connecting);
        assert_eq!(snapshot.queue_depth.total(), 5);
        assert_eq!(snapshot.circuit_state, CircuitState::Open);
        assert_eq!(snapshot.circuit_failure_count, 3);
        assert!(snapshot.last_heartbeat_at.is_some());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = StatsCollector::new();
        let json = serde_json::to_value(stats.snapshot(0)).unwrap();
        assert_eq!(json["state"], "disconnected");
        assert_eq!(json["circuit_state"], "CLOSED");
    }
}
