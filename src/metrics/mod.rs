//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and pending/stuck bookkeeping
//! - Stuck transaction recovery
//! - Gas prices and admission gate state
//! - RPC errors and chain health

use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "coordinator_chain_connected",
        "Chain RPC health (1=healthy, 0=unhealthy)",
        &["chain"]
    ).unwrap();

    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "coordinator_rpc_errors_total",
        "RPC calls that failed after all retries",
        &["chain", "operation"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "coordinator_nonces_allocated_total",
        "Total nonces handed out",
        &["chain"]
    ).unwrap();

    pub static ref NONCE_PENDING: GaugeVec = register_gauge_vec!(
        "coordinator_pending_transactions",
        "Transactions reported submitted but not yet confirmed",
        &["chain"]
    ).unwrap();

    pub static ref NONCE_STUCK: GaugeVec = register_gauge_vec!(
        "coordinator_stuck_transactions",
        "Pending transactions past the stuck threshold",
        &["chain"]
    ).unwrap();

    pub static ref RECOVERY_ATTEMPTS: CounterVec = register_counter_vec!(
        "coordinator_recovery_attempts_total",
        "Fee escalations suggested for stuck transactions",
        &["chain"]
    ).unwrap();

    pub static ref RECOVERY_EXHAUSTED: CounterVec = register_counter_vec!(
        "coordinator_recovery_exhausted_total",
        "Recovery requests refused because the attempt limit was reached",
        &["chain"]
    ).unwrap();

    pub static ref EMERGENCY_RESYNCS: CounterVec = register_counter_vec!(
        "coordinator_emergency_resyncs_total",
        "Manual nonce resets from chain truth",
        &["chain"]
    ).unwrap();

    // Gas metrics
    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "coordinator_gas_price_gwei",
        "Last sampled gas price in gwei",
        &["chain"]
    ).unwrap();

    pub static ref GATE_PAUSED: GaugeVec = register_gauge_vec!(
        "coordinator_gate_paused",
        "Admission gate pause status (1=paused, 0=active)",
        &["chain"]
    ).unwrap();

    pub static ref ADMISSION_DECISIONS: CounterVec = register_counter_vec!(
        "coordinator_admission_decisions_total",
        "Admission decisions by outcome",
        &["chain", "reason"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "coordinator_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "coordinator_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Render all registered metrics in the Prometheus text format
pub fn render() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| CoordinatorError::Internal(format!("metrics encoding: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| CoordinatorError::Internal(format!("metrics encoding: {}", e)))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_rpc_error(chain: &str, operation: &str) {
    RPC_ERRORS.with_label_values(&[chain, operation]).inc();
}

pub fn record_nonce_allocated(chain: &str) {
    NONCES_ALLOCATED.with_label_values(&[chain]).inc();
}

pub fn record_nonce_tracking(chain: &str, pending: usize, stuck: usize) {
    NONCE_PENDING.with_label_values(&[chain]).set(pending as f64);
    NONCE_STUCK.with_label_values(&[chain]).set(stuck as f64);
}

pub fn record_recovery_attempt(chain: &str) {
    RECOVERY_ATTEMPTS.with_label_values(&[chain]).inc();
}

pub fn record_recovery_exhausted(chain: &str) {
    RECOVERY_EXHAUSTED.with_label_values(&[chain]).inc();
}

pub fn record_emergency_resync(chain: &str) {
    EMERGENCY_RESYNCS.with_label_values(&[chain]).inc();
}

pub fn record_gas_price(chain: &str, gwei: f64) {
    GAS_PRICE.with_label_values(&[chain]).set(gwei);
}

pub fn record_gate_paused(chain: &str, paused: bool) {
    GATE_PAUSED
        .with_label_values(&[chain])
        .set(if paused { 1.0 } else { 0.0 });
}

pub fn record_admission(chain: &str, reason: &str) {
    ADMISSION_DECISIONS.with_label_values(&[chain, reason]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_nonce_allocated("metrics-test");
        record_gate_paused("metrics-test", true);
        let text = render().unwrap();
        assert!(text.contains("coordinator_nonces_allocated_total"));
        assert!(text.contains("coordinator_gate_paused{chain=\"metrics-test\"} 1"));
    }
}
