//! Prometheus metrics for meshbucket.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "meshbucket_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "meshbucket_http_request_duration_seconds";

/// Completed index rebuilds (counter).
pub const INDEX_REBUILDS_TOTAL: &str = "meshbucket_index_rebuilds_total";

/// Wall time of the last index rebuild in seconds (histogram).
pub const INDEX_REBUILD_DURATION_SECONDS: &str = "meshbucket_index_rebuild_duration_seconds";

/// Entries in the most recently built index (gauge).
pub const INDEX_ENTRIES: &str = "meshbucket_index_entries";

/// Upload placement decisions (counter). Labels: backend (`none` when full).
pub const PLACEMENTS_TOTAL: &str = "meshbucket_placements_total";

/// Failed backend calls (counter). Labels: backend, operation.
pub const BACKEND_ERRORS_TOTAL: &str = "meshbucket_backend_errors_total";

/// Total bytes received in PUT bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "meshbucket_bytes_received_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.  Returns the existing
/// handle when one is already installed.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(INDEX_REBUILDS_TOTAL, "Completed cluster index rebuilds");
    describe_histogram!(
        INDEX_REBUILD_DURATION_SECONDS,
        "Cluster index rebuild duration in seconds"
    );
    describe_gauge!(INDEX_ENTRIES, "Entries in the last rebuilt cluster index");
    describe_counter!(PLACEMENTS_TOTAL, "Upload placement decisions by backend");
    describe_counter!(BACKEND_ERRORS_TOTAL, "Failed backend calls by operation");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (PUT bodies)");
}

/// Count one failed call against `backend`.
pub fn record_backend_error(backend: &str, operation: &'static str) {
    counter!(BACKEND_ERRORS_TOTAL, "backend" => backend.to_string(), "operation" => operation)
        .increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse a request path to a route template for metric labels, so
/// virtual keys never become label values.
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" | "/_cache" | "/_cluster" => {
            path.to_string()
        }
        _ => "/{key}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fixed_routes() {
        for path in ["/", "/health", "/openapi.json", "/metrics", "/_cache", "/_cluster"] {
            assert_eq!(normalize_path(path), path);
        }
    }

    #[test]
    fn test_normalize_keys() {
        assert_eq!(normalize_path("/photo.jpg"), "/{key}");
        assert_eq!(normalize_path("/a/b/c.txt"), "/{key}");
        assert_eq!(normalize_path("/_cluster/extra"), "/{key}");
    }
}
