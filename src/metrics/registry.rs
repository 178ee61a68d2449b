use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for the one latency metric this gateway
/// exposes (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
///
/// The metrics named in §7 are described here — `requests_total`,
/// `waf_rule_hits_total`, `rate_limited_requests_total`,
/// `upstream_latency_seconds`, `upstream_errors_total` — plus
/// `client_aborts_total`, which the forward proxy increments when a client
/// disconnects mid-request, and `routing_errors_total`, which keeps an
/// empty-pool routing failure out of `upstream_errors_total`'s contractual
/// `{timeout, connect, read}` label set (§4.4).
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global Prometheus recorder and registers metric
    /// descriptions. Must be called once at startup before any `counter!` /
    /// `histogram!` call anywhere in the crate.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "upstream_latency_seconds".to_string(),
                ),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "requests_total",
            Unit::Count,
            "Total requests handled, labeled by final verdict and response status"
        );
        describe_counter!(
            "waf_rule_hits_total",
            Unit::Count,
            "Total rule hits, labeled by rule id"
        );
        describe_counter!(
            "rate_limited_requests_total",
            Unit::Count,
            "Total requests rejected by the rate limiter, labeled by client ip"
        );
        describe_histogram!(
            "upstream_latency_seconds",
            Unit::Seconds,
            "End-to-end request latency as observed by the gateway"
        );
        describe_counter!(
            "upstream_errors_total",
            Unit::Count,
            "Total upstream failures, labeled by error type"
        );
        describe_counter!(
            "client_aborts_total",
            Unit::Count,
            "Total requests where the client disconnected before a response was produced"
        );
        describe_counter!(
            "routing_errors_total",
            Unit::Count,
            "Total requests for which no configured upstream matched, labeled by reason"
        );

        Self { handle }
    }

    /// Renders all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
