//! Prometheus metrics for Coffer
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`MetricsRecorder::install`] registers the Prometheus exporter. The
//! rendered text is served at `/_coffer/metrics`.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use coffer_core::{Error, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;
use tracing::debug;

use crate::router::Operation;
use crate::server::AppState;

/// Metric names
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "coffer_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "coffer_http_request_duration_seconds";

    // S3 operation metrics
    pub const S3_OPERATIONS_TOTAL: &str = "coffer_s3_operations_total";
    pub const S3_OPERATION_DURATION_SECONDS: &str = "coffer_s3_operation_duration_seconds";
    pub const S3_OPERATION_ERRORS_TOTAL: &str = "coffer_s3_operation_errors_total";

    // Storage metrics
    pub const STORAGE_BYTES_READ_TOTAL: &str = "coffer_storage_bytes_read_total";
    pub const STORAGE_BYTES_WRITTEN_TOTAL: &str = "coffer_storage_bytes_written_total";

    // Multipart metrics
    pub const MULTIPART_UPLOADS_ACTIVE: &str = "coffer_multipart_uploads_active";
    pub const MULTIPART_PARTS_UPLOADED_TOTAL: &str = "coffer_multipart_parts_uploaded_total";
    pub const MULTIPART_UPLOADS_REAPED_TOTAL: &str = "coffer_multipart_uploads_reaped_total";

    // System metrics
    pub const UPTIME_SECONDS: &str = "coffer_uptime_seconds";
    pub const INFO: &str = "coffer_info";
}

/// Handle on the installed Prometheus exporter
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
    start_time: Instant,
}

impl MetricsRecorder {
    /// Install the process-wide recorder; fails if one is already installed
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            Error::InternalError(format!("failed to install Prometheus recorder: {}", e))
        })?;

        gauge!(names::INFO, "version" => coffer_core::VERSION).set(1.0);

        Ok(Self {
            handle,
            start_time: Instant::now(),
        })
    }

    /// Get metrics output in Prometheus format
    pub fn render(&self) -> String {
        gauge!(names::UPTIME_SECONDS).set(self.start_time.elapsed().as_secs_f64());
        self.handle.render()
    }
}

pub fn record_http_request(method: &str, status: u16, duration_secs: f64) {
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string(),
        "status_class" => format!("{}xx", status / 100)
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration_secs);
}

/// Record an S3 operation
pub fn record_s3_operation(op: Operation, success: bool, duration_secs: f64) {
    let op_name = op.as_str();

    counter!(
        names::S3_OPERATIONS_TOTAL,
        "operation" => op_name,
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);

    histogram!(
        names::S3_OPERATION_DURATION_SECONDS,
        "operation" => op_name
    )
    .record(duration_secs);

    if !success {
        counter!(names::S3_OPERATION_ERRORS_TOTAL, "operation" => op_name).increment(1);
    }
}

pub fn record_bytes_read(bytes: u64) {
    counter!(names::STORAGE_BYTES_READ_TOTAL).increment(bytes);
}

pub fn record_bytes_written(bytes: u64) {
    counter!(names::STORAGE_BYTES_WRITTEN_TOTAL).increment(bytes);
}

pub fn record_part_uploaded() {
    counter!(names::MULTIPART_PARTS_UPLOADED_TOTAL).increment(1);
}

/// Baseline for sessions that outlived the previous process
pub fn set_active_uploads(count: usize) {
    gauge!(names::MULTIPART_UPLOADS_ACTIVE).set(count as f64);
}

pub fn multipart_upload_opened() {
    gauge!(names::MULTIPART_UPLOADS_ACTIVE).increment(1.0);
}

pub fn multipart_upload_closed() {
    gauge!(names::MULTIPART_UPLOADS_ACTIVE).decrement(1.0);
}

pub fn record_upload_reaped() {
    counter!(names::MULTIPART_UPLOADS_REAPED_TOTAL).increment(1);
}

/// Axum middleware for recording HTTP metrics
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    record_http_request(&method, status, duration);

    debug!(
        method = %method,
        path = %path,
        status = %status,
        duration_ms = %(duration * 1000.0),
        "Request completed"
    );

    response
}

/// Handler for `/_coffer/metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
