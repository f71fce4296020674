use crate::error::{Error, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};

lazy_static::lazy_static! {
    // Snapshot counters
    static ref SNAPSHOT_COUNTER: CounterVec = register_counter_vec!(
        "rsv_recovery_snapshots_total",
        "Snapshot attempts by outcome",
        &["kind", "status"]
    ).unwrap();

    static ref SNAPSHOT_BYTES: Gauge = register_gauge!(
        "rsv_recovery_last_snapshot_bytes",
        "Size of the most recent snapshot in bytes"
    ).unwrap();

    static ref EVICTION_COUNTER: CounterVec = register_counter_vec!(
        "rsv_recovery_evictions_total",
        "Snapshots evicted by retention",
        &["rule", "status"]
    ).unwrap();

    static ref RECOVERY_ATTEMPTS: CounterVec = register_counter_vec!(
        "rsv_recovery_attempts_total",
        "Recovery strategy executions",
        &["strategy", "outcome"]
    ).unwrap();

    // One gauge per state, 1 for the current state and 0 otherwise
    static ref ORCHESTRATOR_STATE: GaugeVec = register_gauge_vec!(
        "rsv_recovery_orchestrator_state",
        "Current recovery orchestrator state",
        &["state"]
    ).unwrap();

    static ref HEALTH_POLLS: CounterVec = register_counter_vec!(
        "rsv_recovery_health_polls_total",
        "Health polls by verdict",
        &["verdict"]
    ).unwrap();

    static ref EMERGENCY_REQUESTS: CounterVec = register_counter_vec!(
        "rsv_recovery_emergency_requests_total",
        "Emergency service requests",
        &["route", "status"]
    ).unwrap();
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub fn record_snapshot(kind: &str, success: bool, size: u64) {
    SNAPSHOT_COUNTER
        .with_label_values(&[kind, status_label(success)])
        .inc();
    if success {
        SNAPSHOT_BYTES.set(size as f64);
    }
}

pub fn record_snapshot_skipped() {
    SNAPSHOT_COUNTER
        .with_label_values(&["scheduled", "skipped"])
        .inc();
}

pub fn record_eviction(rule: &str, success: bool) {
    EVICTION_COUNTER
        .with_label_values(&[rule, status_label(success)])
        .inc();
}

pub fn record_attempt(strategy: &str, success: bool) {
    RECOVERY_ATTEMPTS
        .with_label_values(&[strategy, status_label(success)])
        .inc();
}

pub fn set_orchestrator_state(current: &str, all: &[&str]) {
    for state in all {
        ORCHESTRATOR_STATE
            .with_label_values(&[state])
            .set(if *state == current { 1.0 } else { 0.0 });
    }
}

pub fn record_health_poll(healthy: bool) {
    HEALTH_POLLS
        .with_label_values(&[if healthy { "healthy" } else { "unhealthy" }])
        .inc();
}

pub fn record_emergency_request(route: &str, success: bool) {
    EMERGENCY_REQUESTS
        .with_label_values(&[route, status_label(success)])
        .inc();
}

/// Prometheus text exposition of every registered metric.
pub fn export() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Config(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Config(format!("Invalid UTF-8 in metrics: {}", e)))
}
