//! Prometheus metrics for the proxy.
//!
//! Metric names are prefixed with the configured namespace. The recorder is
//! process-wide; counters are the only mutable shared state and are atomic.

use crate::proxy::config::MetricsConfig;
use crate::proxy::headers::TransformStats;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for request/upstream durations, 1 ms to 10 s
pub const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the process-wide Prometheus recorder and return a handle for
/// rendering the exposition format.
pub fn install_recorder(config: &MetricsConfig) -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &DURATION_BUCKETS,
        )?
        .install_recorder()
}

/// Pre-composed metric names for one namespace.
#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    requests_total: String,
    responses_total: String,
    request_duration_seconds: String,
    request_errors_total: String,
    upstream_duration_seconds: String,
    upstream_errors_total: String,
    redirect_rewrites_total: String,
    header_strips_total: String,
    header_adds_total: String,
}

impl ProxyMetrics {
    pub fn new(namespace: &str) -> Self {
        let name = |suffix: &str| format!("{namespace}_{suffix}");
        Self {
            requests_total: name("requests_total"),
            responses_total: name("responses_total"),
            request_duration_seconds: name("request_duration_seconds"),
            request_errors_total: name("request_errors_total"),
            upstream_duration_seconds: name("upstream_duration_seconds"),
            upstream_errors_total: name("upstream_errors_total"),
            redirect_rewrites_total: name("redirect_rewrites_total"),
            header_strips_total: name("header_strips_total"),
            header_adds_total: name("header_adds_total"),
        }
    }

    pub fn record_request(&self, route: &str, method: &str) {
        counter!(
            self.requests_total.clone(),
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .increment(1);
    }

    pub fn record_response(&self, route: &str, method: &str, status: u16) {
        counter!(
            self.responses_total.clone(),
            "route" => route.to_string(),
            "method" => method.to_string(),
            "status_code" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_request_duration(&self, route: &str, method: &str, seconds: f64) {
        histogram!(
            self.request_duration_seconds.clone(),
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .record(seconds);
    }

    pub fn record_request_error(&self, route: &str, method: &str) {
        counter!(
            self.request_errors_total.clone(),
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .increment(1);
    }

    pub fn record_upstream_duration(&self, route: &str, method: &str, seconds: f64) {
        histogram!(
            self.upstream_duration_seconds.clone(),
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .record(seconds);
    }

    pub fn record_upstream_error(&self, route: &str, method: &str) {
        counter!(
            self.upstream_errors_total.clone(),
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .increment(1);
    }

    pub fn record_redirect_rewrite(&self, route: &str, redirect_type: &'static str) {
        counter!(
            self.redirect_rewrites_total.clone(),
            "route" => route.to_string(),
            "redirect_type" => redirect_type
        )
        .increment(1);
    }

    pub fn record_header_transform(&self, route: &str, stats: TransformStats) {
        if stats.stripped > 0 {
            counter!(self.header_strips_total.clone(), "route" => route.to_string())
                .increment(stats.stripped as u64);
        }
        if stats.added > 0 {
            counter!(self.header_adds_total.clone(), "route" => route.to_string())
                .increment(stats.added as u64);
        }
    }
}
