use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Add a `/metrics` route rendering the Prometheus recorder installed for this process.
pub fn add_metrics_route(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

/// Install the process-wide Prometheus recorder.
/// Only one recorder may be installed, so library code and tests never call this.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const LATENCY_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)?
        .install_recorder()
}

/// Middleware recording request counts and durations per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
