//! Prometheus metrics.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, IntCounterVec, TextEncoder, register_int_counter_vec,
};
use std::sync::LazyLock;

/// Outcomes of janitor sweep invocations, labeled by sweep and outcome
/// (`done`, `idle`, `error`).
pub static JANITOR_SWEEP_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "wharf_janitor_sweep_runs_total",
        "Janitor sweep invocations by sweep name and outcome",
        &["sweep", "outcome"]
    )
    .expect("metric registration")
});

/// Manifests accepted by the processor, labeled by kind (`push`, `replication`).
pub static MANIFESTS_STORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "wharf_manifests_stored_total",
        "Manifests stored by the processor, by origin",
        &["origin"]
    )
    .expect("metric registration")
});

/// Blobs materialized, labeled by origin (`upload`, `replication`).
pub static BLOBS_STORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "wharf_blobs_stored_total",
        "Blobs materialized, by origin",
        &["origin"]
    )
    .expect("metric registration")
});

/// Serve the default registry in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("Content-Type", encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain".to_string())],
            format!("failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
