//! Metrics for the connector node.

use std::sync::OnceLock;

#[derive(Debug, Clone, prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "connector")]
struct Metrics {
    /// Total number of Prepare packets accepted from peers.
    packets_received: prometheus::IntCounter,

    /// Total number of Prepare packets forwarded to a next hop.
    packets_forwarded: prometheus::IntCounter,

    /// Rejects returned towards the ingress, by ILP code.
    #[metric(labels("code"))]
    packet_rejects: prometheus::IntCounterVec,

    /// Settlement attempts by outcome.
    #[metric(labels("outcome"))]
    settlements: prometheus::IntCounterVec,

    /// Telemetry WebSocket clients currently connected.
    telemetry_clients: prometheus::IntGauge,

    /// Telemetry clients dropped for not keeping up with their queue.
    telemetry_slow_clients: prometheus::IntCounter,

    /// Event-store writes by outcome.
    #[metric(labels("outcome"))]
    store_writes: prometheus::IntCounterVec,

    /// BTP reconnect attempts.
    reconnects: prometheus::IntCounter,
}

pub fn packet_received() {
    get().packets_received.inc();
}

pub fn packet_forwarded() {
    get().packets_forwarded.inc();
}

pub fn packet_rejected(code: &str) {
    get().packet_rejects.with_label_values(&[code]).inc();
}

pub fn settlement(outcome: &str) {
    get().settlements.with_label_values(&[outcome]).inc();
}

pub fn telemetry_client_connected() {
    get().telemetry_clients.inc();
}

pub fn telemetry_client_disconnected() {
    get().telemetry_clients.dec();
}

pub fn telemetry_client_too_slow() {
    get().telemetry_slow_clients.inc();
}

pub fn store_write(outcome: &str) {
    get().store_writes.with_label_values(&[outcome]).inc();
}

pub fn reconnect_attempt() {
    get().reconnects.inc();
}

fn storage() -> &'static prometheus_metric_storage::StorageRegistry {
    static STORAGE: OnceLock<prometheus_metric_storage::StorageRegistry> = OnceLock::new();
    STORAGE.get_or_init(|| prometheus_metric_storage::StorageRegistry::new(prometheus::Registry::new()))
}

/// The registry backing the `/metrics` endpoint.
pub fn registry() -> &'static prometheus::Registry {
    storage().registry()
}

/// Get the metrics instance.
fn get() -> &'static Metrics {
    Metrics::instance(storage()).expect("unexpected error getting metrics instance")
}
