//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection and degradation status
//! - Events and workflow triggers
//! - Governance writes and nonce resets
//! - Sweep runs and cache size

use crate::coordination::SweepReport;
use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "governance_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).expect("register chain_connected");

    pub static ref CHAIN_DEGRADED: GaugeVec = register_gauge_vec!(
        "governance_relayer_chain_degraded",
        "Chain reconnect attempts exhausted (1=degraded)",
        &["chain_id"]
    ).expect("register chain_degraded");

    pub static ref RECONNECT_ATTEMPTS: CounterVec = register_counter_vec!(
        "governance_relayer_reconnect_attempts_total",
        "Total reconnect attempts",
        &["chain_id"]
    ).expect("register reconnect_attempts");

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "governance_relayer_chain_block_height",
        "Last block scanned for governance events",
        &["chain_id"]
    ).expect("register chain_block_height");

    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "governance_relayer_health_checks_total",
        "Total health-check passes",
        &[]
    ).expect("register health_checks");

    // Event and trigger metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "governance_relayer_events_received_total",
        "Total governance events received by type",
        &["chain_id", "event_type"]
    ).expect("register events_received");

    pub static ref TRIGGERS_HANDLED: CounterVec = register_counter_vec!(
        "governance_relayer_triggers_total",
        "Workflow triggers handled",
        &["trigger", "source"]
    ).expect("register triggers");

    pub static ref WORKFLOW_STATES: CounterVec = register_counter_vec!(
        "governance_relayer_workflow_states_total",
        "Workflow passes by the state they reached",
        &["state"]
    ).expect("register workflow_states");

    // Write metrics
    pub static ref WRITES_SUBMITTED: CounterVec = register_counter_vec!(
        "governance_relayer_writes_submitted_total",
        "Writes mined",
        &["chain_id", "function"]
    ).expect("register writes_submitted");

    pub static ref WRITES_FAILED: CounterVec = register_counter_vec!(
        "governance_relayer_writes_failed_total",
        "Writes that exhausted their retries",
        &["chain_id", "function"]
    ).expect("register writes_failed");

    pub static ref WRITES_ABSORBED: CounterVec = register_counter_vec!(
        "governance_relayer_writes_absorbed_total",
        "Writes whose effect was already present",
        &["function"]
    ).expect("register writes_absorbed");

    pub static ref NONCE_RESETS: CounterVec = register_counter_vec!(
        "governance_relayer_nonce_resets_total",
        "Nonce state resets after sequencing conflicts",
        &["chain_id"]
    ).expect("register nonce_resets");

    // Sweep metrics
    pub static ref SWEEP_DURATION: HistogramVec = register_histogram_vec!(
        "governance_relayer_sweep_duration_seconds",
        "Sweep run duration",
        &["sweep"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).expect("register sweep_duration");

    pub static ref SWEEP_PROPOSALS: CounterVec = register_counter_vec!(
        "governance_relayer_sweep_proposals_total",
        "Proposals handled by sweeps, by result",
        &["sweep", "result"]
    ).expect("register sweep_proposals");

    pub static ref CACHE_SIZE: Gauge = register_gauge!(
        "governance_relayer_cache_proposals",
        "Proposals recorded in the idempotency cache"
    ).expect("register cache_proposals");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("bind metrics {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))
    }
}

pub async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_degraded(chain_id: u64, degraded: bool) {
    CHAIN_DEGRADED
        .with_label_values(&[&chain_id.to_string()])
        .set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_reconnect_attempt(chain_id: u64) {
    RECONNECT_ATTEMPTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_health_check() {
    HEALTH_CHECKS.with_label_values(&[]).inc();
}

pub fn record_event(chain_id: u64, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_trigger(trigger: &str, source: &str) {
    TRIGGERS_HANDLED.with_label_values(&[trigger, source]).inc();
}

pub fn record_workflow_state(state: &str) {
    WORKFLOW_STATES.with_label_values(&[state]).inc();
}

pub fn record_tx_submitted(chain_id: u64, function: &str) {
    WRITES_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), function])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, function: &str) {
    WRITES_FAILED
        .with_label_values(&[&chain_id.to_string(), function])
        .inc();
}

pub fn record_write_absorbed(function: &str) {
    WRITES_ABSORBED.with_label_values(&[function]).inc();
}

pub fn record_nonce_reset(chain_id: u64) {
    NONCE_RESETS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_sweep(sweep: &str, duration: Duration, report: &SweepReport) {
    SWEEP_DURATION
        .with_label_values(&[sweep])
        .observe(duration.as_secs_f64());
    for (result, count) in [
        ("examined", report.examined),
        ("skipped", report.skipped),
        ("triggered", report.triggered),
        ("failed", report.failed),
    ] {
        SWEEP_PROPOSALS
            .with_label_values(&[sweep, result])
            .inc_by(count as f64);
    }
}

pub fn set_cache_size(size: usize) {
    CACHE_SIZE.set(size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_exports_relayer_metrics() {
        record_chain_degraded(424242, true);
        record_write_absorbed("finalizeVotes");

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("governance_relayer_chain_degraded{chain_id=\"424242\"} 1"));
        assert!(body.contains("governance_relayer_writes_absorbed_total"));
    }
}
