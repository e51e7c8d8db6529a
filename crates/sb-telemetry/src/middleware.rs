use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::{names, MetricsCollector};

/// Axum middleware recording `http_requests_total` and
/// `http_request_duration_seconds`.
///
/// Install with `axum::middleware::from_fn_with_state(metrics, metrics_middleware)`.
/// The route template is used as the `path` label so ids in paths do not
/// explode label cardinality.
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics.increment_counter(
        names::HTTP_REQUESTS_TOTAL,
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    metrics.record_histogram(
        names::HTTP_REQUEST_DURATION_SECONDS,
        start.elapsed().as_secs_f64(),
    );

    response
}
