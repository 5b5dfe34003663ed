//! Prometheus metrics helpers for the outbox engine.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across the outbox crates.
//!
//! # Usage
//!
//! ```rust,ignore
//! use outbox_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("outbox_relay_fetches_total", "result" => "ok").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `outbox_`
//! - Suffix: Unit or type (e.g., `_total`, `_seconds`)
//! - Labels: only low-cardinality values (`result`, `reason`, `state`), never relay URLs

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` before returning so bind errors surface to the
/// caller, then serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics emitted by the outbox crates.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Relay list / follow list resolution
    // =========================================================================

    describe_counter!(
        "outbox_relay_list_cache_hits_total",
        "Authors served from the relay list cache without a network fetch"
    );
    describe_counter!(
        "outbox_relay_list_cache_misses_total",
        "Authors whose relay list had to be fetched"
    );
    describe_counter!(
        "outbox_relay_list_fetch_errors_total",
        "Relay list batch requests that failed"
    );
    describe_counter!(
        "outbox_relay_list_snapshot_loads_total",
        "Persisted relay list snapshot loads (label: result = ok | missing | error | corrupt | version | expired)"
    );
    describe_counter!(
        "outbox_follow_list_fetches_total",
        "Follow list network fetches (label: result = ok | missing | error)"
    );

    // =========================================================================
    // Planning
    // =========================================================================

    describe_gauge!("outbox_plan_relays", "Relays selected by the last query plan");
    describe_gauge!(
        "outbox_plan_authors_covered",
        "Authors covered by the last query plan"
    );
    describe_counter!(
        "outbox_plan_relays_skipped_total",
        "Relays skipped because the relay cap was reached"
    );

    // =========================================================================
    // Fetching
    // =========================================================================

    describe_counter!(
        "outbox_relay_fetches_total",
        "Per-relay fetches (label: result = ok | timeout | error)"
    );
    describe_histogram!(
        "outbox_relay_fetch_duration_seconds",
        "Latency of successful per-relay fetches"
    );
    describe_counter!(
        "outbox_events_received_total",
        "Events received from relays before deduplication"
    );
    describe_counter!(
        "outbox_events_duplicate_total",
        "Events dropped because another relay already delivered them"
    );
    describe_counter!(
        "outbox_fetch_stopped_early_total",
        "Fetches that stopped before all waves ran (label: reason)"
    );
    describe_counter!(
        "outbox_feed_superseded_total",
        "Feed operations whose results were discarded because a newer one started"
    );

    // =========================================================================
    // Relay health
    // =========================================================================

    describe_counter!(
        "outbox_relay_health_transitions_total",
        "Relay health state transitions (label: state)"
    );
}
