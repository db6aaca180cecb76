//! Tracing subscriber and Prometheus exporter setup.

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::LogFormat;

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Returns `false` if a
/// subscriber was already installed, which is expected in tests.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(filter)
            .try_init(),
    };

    match result {
        Ok(()) => {
            info!(format = ?format, "tracing initialized");
            true
        }
        Err(_) => {
            debug!("tracing already initialized");
            false
        }
    }
}

/// Serves `/metrics` on `addr` and installs the global recorder.
///
/// Must be called from inside a tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or `addr` cannot be bound.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing prometheus exporter on {addr}"))?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}
