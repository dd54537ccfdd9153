//! Logging and metrics setup, plus the counters the relay records.

use std::net::{Ipv4Addr, SocketAddr};

use courier_core::EventKind;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, TelemetryConfig};

const DEFAULT_FILTER: &str = "info";

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `config.log_filter`, then `RUST_LOG`, then `info`.
///
/// # Errors
///
/// Returns an error if the filter does not parse or a subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = match &config.log_filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Fmt => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
    }
    Ok(())
}

/// Starts the Prometheus scrape endpoint on `port` and installs it as the
/// global metrics recorder. Must run inside a tokio runtime.
///
/// # Errors
///
/// Returns an error if the listener cannot be set up or a recorder is already installed.
pub fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

pub(crate) fn record_published(queue: &str, kind: EventKind) {
    metrics::counter!(
        "courier_published_total",
        "queue" => queue.to_owned(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub(crate) fn record_publish_failure(queue: &str, reason: &'static str) {
    metrics::counter!(
        "courier_publish_failures_total",
        "queue" => queue.to_owned(),
        "reason" => reason
    )
    .increment(1);
}

pub(crate) fn record_auth_rejection(reason: &'static str) {
    metrics::counter!("courier_auth_rejections_total", "reason" => reason).increment(1);
}

pub(crate) fn record_drained(queue: &str) {
    metrics::counter!("courier_drained_total", "queue" => queue.to_owned()).increment(1);
}

pub(crate) fn record_rejected_delivery(queue: &str) {
    metrics::counter!("courier_rejected_deliveries_total", "queue" => queue.to_owned())
        .increment(1);
}
