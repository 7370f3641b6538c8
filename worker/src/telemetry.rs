//! Tracing and metrics setup shared by the binaries.

use crate::config::ServerConfig;
use courier_runtime::metrics::MetricsServer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,courier=debug,sqlx=warn";

/// Install the global `tracing` subscriber (env filter + fmt layer).
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the Prometheus scrape endpoint.
///
/// # Errors
///
/// Returns an error if the address is invalid or the exporter cannot be installed.
pub fn start_metrics(server: &ServerConfig) -> anyhow::Result<MetricsServer> {
    let mut metrics = MetricsServer::new(server.metrics_addr()?);
    metrics.start()?;
    Ok(metrics)
}
