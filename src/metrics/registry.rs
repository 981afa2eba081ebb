use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// admin endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "wraith_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "wraith_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "wraith_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (time spent waiting for upstream)"
        );
        describe_gauge!(
            "wraith_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // admission
        describe_counter!(
            "wraith_admission_rejected_total",
            Unit::Count,
            "Total requests rejected by admission control, labeled by reason"
        );
        describe_counter!(
            "wraith_admission_autoblocks_total",
            Unit::Count,
            "Total clients auto-blocked after repeated violations"
        );
        describe_gauge!(
            "wraith_admission_blocked_clients",
            Unit::Count,
            "Clients currently in the auto-block map"
        );
        describe_counter!(
            "wraith_ddos_dropped_connections_total",
            Unit::Count,
            "Connections dropped at accept by the burst tracker"
        );

        // upstream health
        describe_gauge!(
            "wraith_upstream_health_status",
            Unit::Count,
            "Upstream health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "wraith_health_check_total",
            Unit::Count,
            "Total active health probe attempts"
        );

        // connection pool
        describe_counter!(
            "wraith_connection_pool_hits_total",
            Unit::Count,
            "Upstream connection pool hits"
        );
        describe_counter!(
            "wraith_connection_pool_misses_total",
            Unit::Count,
            "Upstream connection pool misses (new connections opened)"
        );

        // static cache
        describe_counter!(
            "wraith_static_cache_hits_total",
            Unit::Count,
            "Static file cache hits"
        );
        describe_counter!(
            "wraith_static_cache_misses_total",
            Unit::Count,
            "Static file cache misses (loads from disk)"
        );

        // connections
        describe_gauge!(
            "wraith_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "wraith_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // config
        describe_counter!(
            "wraith_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
