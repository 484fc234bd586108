/*!
 * Logging functionality for inkdev.
 *
 * This module provides tracing setup and span helpers so device lifecycles
 * can be followed across transport callbacks.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "inkdev_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the `[logging]` configuration section
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter {:?}: {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(config.with_target)
                .with_ansi(config.ansi),
        )
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for one device connection
///
/// # Arguments
///
/// * `device_id` - The descriptor id of the device
/// * `transport` - The transport name (BLE, USB, BTC)
pub fn device_span(device_id: &str, transport: &str) -> Span {
    tracing::info_span!("device", id = %device_id, transport = %transport)
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second global subscriber fails, the first call may come from another test
        let _ = init();
        assert!(init().is_err());
    }

    #[test]
    fn test_device_span() {
        let span = device_span("ble-01", "BLE");
        // No subscriber enabled for this span in unit tests
        let _entered = span.enter();
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("connect", "factory");
        let _entered = span.enter();
    }
}
