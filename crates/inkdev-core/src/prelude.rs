/*!
 * Prelude module for inkdev Core.
 *
 * This module re-exports commonly used types and functions from the inkdev Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{object, Id, Value};

// Re-export event types
pub use crate::event::{EventHub, Subscription};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{
    duration_to_millis, millis_to_duration, spawn_and_log, with_cancel, with_timeout,
};

// Re-export cancellation
pub use tokio_util::sync::CancellationToken;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
