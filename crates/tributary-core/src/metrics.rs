//! Prometheus metrics and health signalling for tributary.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tributary_core::metrics::{init_metrics, start_metrics_server, HealthState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     let health = HealthState::new(50);
//!     start_metrics_server(9090, handle, health.clone()).await.unwrap();
//!
//!     metrics::counter!("ingest_messages_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `archive_`, `table_`, `sink_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only low-cardinality ones (`branch`, `table`)

use axum::http::StatusCode;
use axum::{Json, Router, extract::State, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Initialize the Prometheus metrics recorder.
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

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Process-level health derived from consecutive delivery failures.
///
/// A single failed message never makes the process unhealthy. A sustained
/// run of failures (a store outage) does, so an external supervisor can
/// restart or alert. Any successful delivery resets the run.
#[derive(Debug, Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

#[derive(Debug)]
struct HealthInner {
    consecutive_failures: AtomicU64,
    threshold: u64,
}

impl HealthState {
    /// `threshold` consecutive failures mark the process degraded.
    /// A threshold of zero disables the check.
    pub fn new(threshold: u64) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                consecutive_failures: AtomicU64::new(0),
                threshold,
            }),
        }
    }

    pub fn record_success(&self) {
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let n = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.inner.threshold > 0 && n == self.inner.threshold {
            tracing::error!(
                consecutive_failures = n,
                "delivery failures reached health threshold, reporting degraded"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.threshold == 0 || self.consecutive_failures() < self.inner.threshold
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Body of the `/health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    consecutive_failures: u64,
}

async fn health_check(State(health): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = health.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            consecutive_failures: health.consecutive_failures(),
        }),
    )
}

/// Build the router serving `/metrics` and `/health`.
pub fn metrics_router(handle: PrometheusHandle, health: HealthState) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/health", get(health_check))
        .with_state(health)
}

/// Start the metrics HTTP server in a background task.
///
/// Binding happens before this returns, so a port conflict is reported to
/// the caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    health: HealthState,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = metrics_router(handle, health);

    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics tributary records.
fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!("ingest_messages_total", "Messages pulled from the subscription");
    describe_counter!(
        "ingest_decode_failures_total",
        "Messages dropped because the payload is not a UTF-8 JSON object"
    );
    describe_counter!(
        "ingest_unroutable_total",
        "Valid events whose event_type has no route"
    );
    describe_counter!(
        "ingest_timestamp_fallback_total",
        "Events archived by ingestion time because their event time was unusable"
    );
    describe_counter!("ingest_messages_acked_total", "Messages acknowledged");
    describe_counter!(
        "ingest_messages_nacked_total",
        "Messages returned for redelivery after a failed sink write"
    );
    describe_counter!(
        "ingest_dead_letter_total",
        "Messages dropped after exceeding the delivery limit"
    );
    describe_gauge!("ingest_inflight", "Messages currently being processed");
    describe_gauge!(
        "ingest_running",
        "Whether the ingestion loop is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Archive (blob) sink
    // =========================================================================

    describe_counter!("archive_blobs_written_total", "Blobs written to the archive");
    describe_counter!(
        "archive_write_failures_total",
        "Archive writes that failed after all retries"
    );
    describe_histogram!(
        "archive_write_duration_seconds",
        "Time spent writing one archive blob, retries included"
    );

    // =========================================================================
    // Table sink
    // =========================================================================

    describe_counter!(
        "table_rows_appended_total",
        "Rows appended to analytical tables (label: table)"
    );
    describe_counter!(
        "table_append_failures_total",
        "Rows the table still refused after retries and batch splitting (label: table)"
    );
    describe_counter!(
        "table_batch_splits_total",
        "Failed batches split to isolate rejected rows (label: table)"
    );
    describe_counter!("table_batches_flushed_total", "Table batches flushed");
    describe_histogram!(
        "table_flush_duration_seconds",
        "Time spent flushing one table batch, retries included"
    );

    // =========================================================================
    // Retries
    // =========================================================================

    describe_counter!(
        "sink_retries_total",
        "Sink write retries (label: branch = archive|table)"
    );
}
