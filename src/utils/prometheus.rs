//! Prometheus metrics
//!
//! HTTP requests are counted and timed by [`track_requests`]; the `/metrics`
//! route renders everything recorded through the global recorder.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

use crate::error::{FriendError, Result};

pub const HTTP_REQUESTS: &str = "aifriend_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "aifriend_http_request_duration_seconds";

/// Whole seconds from 1 to 10; a reply takes seconds, not milliseconds
const LATENCY_BUCKETS: [f64; 10] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide recorder once; later calls return the same handle
pub fn install_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }

    let recorder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(HTTP_REQUEST_DURATION.to_string()), &LATENCY_BUCKETS)
        .map_err(|e| FriendError::Config(format!("metrics: {}", e)))?
        .build_recorder();
    let handle = recorder.handle();

    let handle = HANDLE.get_or_init(|| {
        // Only the first caller's recorder becomes global
        if metrics::set_global_recorder(recorder).is_err() {
            warn!("Another metrics recorder is already installed");
        }
        handle
    });
    Ok(handle.clone())
}

/// Count and time every routed request by method, route and status
pub async fn track_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());
    response
}
