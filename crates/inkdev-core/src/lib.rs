/*!
 * inkdev Core
 *
 * This crate provides the shared runtime pieces for the inkdev client library:
 * the error type, configuration loading, logging setup, dynamically typed
 * property values and the ordered event hub used for device callbacks.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tokio_util;
    pub use tracing;
    pub use uuid;
}

pub use error::{Error, Result};

/// inkdev core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<()> {
    logging::init()?;
    tracing::info!("inkdev core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
