//! Telemetry module for Authority
//!
//! Prometheus metrics for the token hot path and HTTP traffic.

use crate::{AuthorityError, Result};
use axum::{extract::Request, middleware::Next, response::Response};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, TextEncoder, register_counter_vec,
    register_histogram_vec,
};

/// HTTP requests total counter
static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authority_http_requests_total",
        "Total number of HTTP requests received",
        &["method", "code"]
    )
    .expect("http request counter registers once")
});

/// HTTP request duration histogram
static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        HistogramOpts::new(
            "authority_http_request_duration_seconds",
            "Duration of HTTP requests in seconds"
        ),
        &["method"]
    )
    .expect("http duration histogram registers once")
});

/// Tokens minted, by grant
static TOKENS_ISSUED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authority_tokens_issued_total",
        "Total number of token sets issued",
        &["grant"]
    )
    .expect("token counter registers once")
});

/// Authorization code redemption attempts, by outcome
static CODE_REDEMPTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authority_code_redemptions_total",
        "Total number of authorization code redemption attempts",
        &["outcome"]
    )
    .expect("redemption counter registers once")
});

/// Blacklist lookups, by outcome (valid, revoked, unavailable)
static BLACKLIST_CHECKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authority_blacklist_checks_total",
        "Total number of token blacklist checks",
        &["outcome"]
    )
    .expect("blacklist counter registers once")
});

/// Record HTTP request metric
pub fn record_http_request(method: &str, status_code: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, &status_code.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

pub fn record_tokens_issued(grant: &str) {
    TOKENS_ISSUED_TOTAL.with_label_values(&[grant]).inc();
}

pub fn record_code_redemption(outcome: &str) {
    CODE_REDEMPTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_blacklist_check(outcome: &str) {
    BLACKLIST_CHECKS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Axum middleware recording count and latency of every request
pub async fn track_http(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let start = std::time::Instant::now();
    let response = next.run(request).await;
    record_http_request(
        &method,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Get Prometheus metrics in text format
pub fn get_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AuthorityError::config(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| AuthorityError::config(format!("Failed to convert metrics to UTF-8: {}", e)))
}
