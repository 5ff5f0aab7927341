use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize structured logging (RUST_LOG driven).
/// JSON output is used for production; pretty output for dev.
pub fn init_telemetry(app: &AppConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if app.env.eq_ignore_ascii_case("dev") {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    } else {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    }

    Ok(())
}
