use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`) can be used anywhere in the codebase. The `PrometheusHandle` is
/// retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!`
    /// calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // discovery stream
        describe_gauge!(
            "traffic_clusters_tracked",
            Unit::Count,
            "Gauge of tracked clusters"
        );
        describe_gauge!(
            "traffic_endpoints_tracked",
            Unit::Count,
            "Gauge of tracked endpoints"
        );
        describe_counter!(
            "traffic_ads_reconnects_total",
            Unit::Count,
            "Discovery stream attempts that ended in an error"
        );

        // DNS serving
        describe_counter!(
            "traffic_dns_requests_total",
            Unit::Count,
            "DNS questions dispatched to the traffic handler"
        );
        describe_counter!(
            "traffic_dns_responses_total",
            Unit::Count,
            "DNS responses written, labelled by rcode"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
