//! Tracing and metrics initialization

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON tracing from the configured log level
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "tracing initialized"
    );

    Ok(())
}

/// Install the Prometheus metrics recorder and describe the service counters.
///
/// Returns the handle used by the `/metrics` endpoint to render the
/// exposition format.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::error::Error::Internal(format!("failed to install metrics recorder: {e}")))?;

    metrics::describe_counter!(
        "csrf.validation.failures",
        "CSRF verification failures by reason"
    );
    metrics::describe_counter!(
        "websocket.errors",
        "WebSocket delivery errors by error_type"
    );
    metrics::describe_counter!(
        "eventbus.malformed",
        "Event bus messages dropped at the deserialization boundary"
    );
    metrics::describe_counter!(
        "notifications.delivered",
        "Notifications delivered by channel"
    );
    metrics::describe_counter!(
        "notifications.delivery_failed",
        "Notification delivery failures by channel"
    );

    Ok(handle)
}
