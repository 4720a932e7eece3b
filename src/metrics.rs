//! Metrics initialization for Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Queries answered with the null address.
pub const QUERIES_BLOCKED: &str = "nullroute_queries_blocked_total";
/// Queries relayed and answered by an upstream.
pub const QUERIES_FORWARDED: &str = "nullroute_queries_forwarded_total";
/// Queries no upstream answered.
pub const QUERIES_DROPPED: &str = "nullroute_queries_dropped_total";
pub const PARSE_ERRORS: &str = "nullroute_parse_errors_total";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape. Must run inside a tokio
/// runtime.
///
/// When metrics are disabled, this is a no-op and the counters recorded by
/// the server go nowhere.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    metrics::describe_counter!(QUERIES_BLOCKED, "Queries answered with the null address");
    metrics::describe_counter!(QUERIES_FORWARDED, "Queries answered by an upstream server");
    metrics::describe_counter!(QUERIES_DROPPED, "Queries no upstream server answered");
    metrics::describe_counter!(PARSE_ERRORS, "Datagrams that were not valid DNS queries");

    Ok(())
}
