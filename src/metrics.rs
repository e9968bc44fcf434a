//! Prometheus series for the pipeline core.
//!
//! Counters and gauges are updated by the metrics sink and the SSE engine;
//! `/metrics` exposes the standard text format. Everything here is
//! process-local state; shipping it anywhere is external.

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "relaymux_requests_total",
        "Total number of requests per pipeline",
        &["pipeline"]
    )
    .unwrap();

    static ref FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "relaymux_failures_total",
        "Total number of failures per pipeline and kind",
        &["pipeline", "kind"]
    )
    .unwrap();

    static ref UPSTREAM_LATENCY: HistogramVec = register_histogram_vec!(
        "relaymux_upstream_latency_seconds",
        "Upstream call latency in seconds per pipeline",
        &["pipeline"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    static ref ACTIVE_STREAMS: Gauge = register_gauge!(
        "relaymux_active_streams",
        "Current number of active SSE streams"
    )
    .unwrap();

    static ref STREAM_BACKPRESSURE: Counter = register_counter!(
        "relaymux_stream_backpressure_total",
        "Times an SSE producer found the forwarding channel full"
    )
    .unwrap();

    static ref BREAKER_REJECTIONS: CounterVec = register_counter_vec!(
        "relaymux_breaker_rejections_total",
        "Requests rejected because a pipeline's breaker was open",
        &["pipeline"]
    )
    .unwrap();
}

pub fn record_request(pipeline: &str) {
    REQUESTS_TOTAL.with_label_values(&[pipeline]).inc();
}

pub fn record_failure(pipeline: &str, kind: &str) {
    FAILURES_TOTAL.with_label_values(&[pipeline, kind]).inc();
}

pub fn record_upstream_latency(pipeline: &str, seconds: f64) {
    UPSTREAM_LATENCY
        .with_label_values(&[pipeline])
        .observe(seconds);
}

pub fn increment_active_streams(delta: i64) {
    ACTIVE_STREAMS.add(delta as f64);
}

pub fn record_stream_backpressure() {
    STREAM_BACKPRESSURE.inc();
}

pub fn record_breaker_rejection(pipeline: &str) {
    BREAKER_REJECTIONS.with_label_values(&[pipeline]).inc();
}

/// `GET /metrics` handler.
pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics".to_string(),
        );
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        record_request("test-pipeline");
        record_request("test-pipeline");
        let value = REQUESTS_TOTAL
            .with_label_values(&["test-pipeline"])
            .get();
        assert!(value >= 2.0);
    }

    #[test]
    fn active_streams_gauge_balances() {
        let before = ACTIVE_STREAMS.get();
        increment_active_streams(1);
        increment_active_streams(-1);
        assert_eq!(ACTIVE_STREAMS.get(), before);
    }

    #[tokio::test]
    async fn metrics_handler_renders_text() {
        record_failure("test-pipeline", "backend_transient");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
