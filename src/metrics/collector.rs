//! Metrics Collector

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
use std::time::Duration;
use tracing::{debug, error};

use crate::events::{Direction, TransferObserver};

/// Prometheus counters for one relay instance.
///
/// Each instance owns its own registry, so several engines in one process
/// never collide on metric registration.
pub struct Metrics {
    prometheus_registry: Registry,

    connections_total: Counter,
    connections_rejected_total: Counter,
    active_sessions: Gauge,
    session_duration: Histogram,
    bytes_client_to_server_total: Counter,
    bytes_server_to_client_total: Counter,
    dial_failures_total: Counter,
    handshake_failures_total: Counter,
    registration_conflicts_total: Counter,
    expired_sessions_total: Counter,
}

impl Metrics {
    /// Create and register the relay metrics
    pub fn new() -> anyhow::Result<Self> {
        let prometheus_registry = Registry::new();

        let connections_total = Counter::new(
            "nrelay_connections_total",
            "Total number of accepted client connections",
        )?;

        let connections_rejected_total = Counter::new(
            "nrelay_connections_rejected_total",
            "Connections closed because the connection limit was reached",
        )?;

        let active_sessions = Gauge::new(
            "nrelay_active_sessions",
            "Number of sessions currently relaying data",
        )?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "nrelay_session_duration_seconds",
                "Duration of relay sessions in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 3600.0]),
        )?;

        let bytes_client_to_server_total = Counter::new(
            "nrelay_bytes_client_to_server_total",
            "Bytes forwarded from clients to targets",
        )?;

        let bytes_server_to_client_total = Counter::new(
            "nrelay_bytes_server_to_client_total",
            "Bytes forwarded from targets to clients",
        )?;

        let dial_failures_total = Counter::new(
            "nrelay_dial_failures_total",
            "Outbound target connections that could not be established",
        )?;

        let handshake_failures_total = Counter::new(
            "nrelay_handshake_failures_total",
            "Repeater negotiations that ended without a target",
        )?;

        let registration_conflicts_total = Counter::new(
            "nrelay_registration_conflicts_total",
            "Repeater connections dropped because their endpoint already had a session",
        )?;

        let expired_sessions_total = Counter::new(
            "nrelay_expired_sessions_total",
            "Repeater sessions closed by the lifetime sweep",
        )?;

        prometheus_registry.register(Box::new(connections_total.clone()))?;
        prometheus_registry.register(Box::new(connections_rejected_total.clone()))?;
        prometheus_registry.register(Box::new(active_sessions.clone()))?;
        prometheus_registry.register(Box::new(session_duration.clone()))?;
        prometheus_registry.register(Box::new(bytes_client_to_server_total.clone()))?;
        prometheus_registry.register(Box::new(bytes_server_to_client_total.clone()))?;
        prometheus_registry.register(Box::new(dial_failures_total.clone()))?;
        prometheus_registry.register(Box::new(handshake_failures_total.clone()))?;
        prometheus_registry.register(Box::new(registration_conflicts_total.clone()))?;
        prometheus_registry.register(Box::new(expired_sessions_total.clone()))?;

        Ok(Self {
            prometheus_registry,
            connections_total,
            connections_rejected_total,
            active_sessions,
            session_duration,
            bytes_client_to_server_total,
            bytes_server_to_client_total,
            dial_failures_total,
            handshake_failures_total,
            registration_conflicts_total,
            expired_sessions_total,
        })
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
    }

    pub fn record_connection_rejected(&self) {
        self.connections_rejected_total.inc();
    }

    pub fn record_session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn record_session_ended(&self, duration: Duration) {
        self.active_sessions.dec();
        self.session_duration.observe(duration.as_secs_f64());
        debug!(duration_secs = duration.as_secs_f64(), "Recorded session end");
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures_total.inc();
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures_total.inc();
    }

    pub fn record_registration_conflict(&self) {
        self.registration_conflicts_total.inc();
    }

    pub fn record_expired_sessions(&self, count: usize) {
        self.expired_sessions_total.inc_by(count as f64);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_total.get() as u64
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected_total.get() as u64
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get() as i64
    }

    pub fn bytes_client_to_server(&self) -> u64 {
        self.bytes_client_to_server_total.get() as u64
    }

    pub fn bytes_server_to_client(&self) -> u64 {
        self.bytes_server_to_client_total.get() as u64
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures_total.get() as u64
    }

    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures_total.get() as u64
    }

    pub fn registration_conflicts(&self) -> u64 {
        self.registration_conflicts_total.get() as u64
    }

    pub fn expired_sessions(&self) -> u64 {
        self.expired_sessions_total.get() as u64
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}

impl TransferObserver for Metrics {
    fn on_client_to_server(&self, byte_count: usize) {
        self.bytes_client_to_server_total.inc_by(byte_count as f64);
    }

    fn on_server_to_client(&self, byte_count: usize) {
        self.bytes_server_to_client_total.inc_by(byte_count as f64);
    }

    fn on_bytes_transferred(&self, _direction: Direction, _payload: &[u8]) {}
}
