//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Quote building
//! - Run and node lifecycle
//! - Dispatch retries and failures

use crate::error::{ExecutorError, ExecutorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "supertx_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "supertx_chain_block_height",
        "Current block height per chain",
        &["chain_id"]
    ).unwrap();

    // Quote metrics
    pub static ref QUOTES_BUILT: CounterVec = register_counter_vec!(
        "supertx_quotes_built_total",
        "Total quotes built",
        &[]
    ).unwrap();

    pub static ref QUOTES_FAILED: CounterVec = register_counter_vec!(
        "supertx_quotes_failed_total",
        "Total quote requests rejected, by error kind",
        &["kind"]
    ).unwrap();

    pub static ref QUOTE_LATENCY: HistogramVec = register_histogram_vec!(
        "supertx_quote_latency_seconds",
        "Time to resolve, plan and price an instruction set",
        &[],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    // Run metrics
    pub static ref RUNS_STARTED: CounterVec = register_counter_vec!(
        "supertx_runs_started_total",
        "Total runs started",
        &[]
    ).unwrap();

    pub static ref RUNS_FINISHED: CounterVec = register_counter_vec!(
        "supertx_runs_finished_total",
        "Total runs settled, by outcome",
        &["state"]
    ).unwrap();

    pub static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "supertx_run_duration_seconds",
        "Wall time from start to settlement",
        &["state"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    ).unwrap();

    pub static ref LIVE_RUNS: Gauge = register_gauge!(
        "supertx_live_runs",
        "Runs currently held in memory"
    ).unwrap();

    // Node metrics
    pub static ref NODE_TRANSITIONS: CounterVec = register_counter_vec!(
        "supertx_node_transitions_total",
        "Node state transitions",
        &["kind", "state"]
    ).unwrap();

    pub static ref NODE_FAILURES: CounterVec = register_counter_vec!(
        "supertx_node_failures_total",
        "Node failures by reason code",
        &["chain_id", "code"]
    ).unwrap();

    pub static ref NODE_LATENCY: HistogramVec = register_histogram_vec!(
        "supertx_node_latency_seconds",
        "Time from submission to confirmation",
        &["kind", "chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Dispatch metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "supertx_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "supertx_transactions_failed_total",
        "Total transaction submissions that failed",
        &["chain_id"]
    ).unwrap();

    pub static ref DISPATCH_RETRIES: CounterVec = register_counter_vec!(
        "supertx_dispatch_retries_total",
        "Retries of retryable dispatch errors",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "supertx_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "supertx_health_check_failure_total",
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

    pub async fn run(&self) -> ExecutorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ExecutorError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ExecutorError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
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

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_quote_built(latency_secs: f64) {
    QUOTES_BUILT.with_label_values(&[]).inc();
    QUOTE_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_quote_failed(kind: &str) {
    QUOTES_FAILED.with_label_values(&[kind]).inc();
}

pub fn record_run_started() {
    RUNS_STARTED.with_label_values(&[]).inc();
}

pub fn record_run_finished(state: &str, duration_secs: f64) {
    RUNS_FINISHED.with_label_values(&[state]).inc();
    RUN_DURATION.with_label_values(&[state]).observe(duration_secs);
}

pub fn set_live_runs(count: usize) {
    LIVE_RUNS.set(count as f64);
}

pub fn record_node_transition(kind: &str, state: &str) {
    NODE_TRANSITIONS.with_label_values(&[kind, state]).inc();
}

pub fn record_node_failure(chain_id: u64, code: &str) {
    NODE_FAILURES
        .with_label_values(&[&chain_id.to_string(), code])
        .inc();
}

pub fn record_node_latency(kind: &str, chain_id: u64, latency_secs: f64) {
    NODE_LATENCY
        .with_label_values(&[kind, &chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_dispatch_retry(chain_id: u64) {
    DISPATCH_RETRIES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
