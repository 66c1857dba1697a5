use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON logging for the broker.
///
/// Correlation IDs ride on spans (see `correlation::operation_span`), so the
/// subscriber emits the current span and the span list with every line.
pub fn init_telemetry(default_level: &str) -> Result<()> {
    let directive = default_level.parse().unwrap_or(tracing::Level::INFO.into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    tracing::info!("tf-broker telemetry initialized with structured logging");
    Ok(())
}

/// Shutdown telemetry gracefully.
pub fn shutdown_telemetry() {
    tracing::info!("tf-broker telemetry shutdown complete");
}
