/*!
 * Error types for ink device operations.
 */
use thiserror::Error;

use inkdev_core::error::Error as CoreError;

use crate::status::DeviceStatus;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device is not connected, or was closed
    #[error("Device not connected")]
    NotConnected,

    /// The property is not supported by the device
    #[error("Property not supported: {0}")]
    PropertyNotSupported(String),

    /// The value type is not valid for the property
    #[error("Invalid value type for property {0}: expected {1}, got {2}")]
    InvalidValueType(String, String, String),

    /// The service or device is in an invalid state for the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Radio or link fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered something the client did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The authorization handshake ended in a terminal status
    #[error("Not authorized: {}", .0.prompt())]
    NotAuthorized(DeviceStatus),

    /// A file transfer unit failed or arrived incomplete
    #[error("File transfer error: {0}")]
    FileTransfer(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[source] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Transport(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Protocol(msg.as_ref().to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new file transfer error
    pub fn file_transfer<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::FileTransfer(msg.as_ref().to_string())
    }

    /// Create a new serialization error
    pub fn serialization<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Serialization(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }

    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeviceError::Cancelled)
    }

    /// Whether this error ends the session with the device
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceError::NotAuthorized(_) | DeviceError::NotConnected | DeviceError::Transport(_)
        )
    }
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Cancelled => DeviceError::Cancelled,
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::Serialization(msg) => DeviceError::Serialization(msg),
            CoreError::Io(e) => DeviceError::Io(e),
            other => DeviceError::Core(other),
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_cancellation_maps_to_cancelled() {
        let err: DeviceError = CoreError::Cancelled.into();
        assert!(err.is_cancelled());

        let err: DeviceError = CoreError::timeout("slow").into();
        assert!(matches!(err, DeviceError::Timeout(ref m) if m == "slow"));

        let err: DeviceError = CoreError::config("bad").into();
        assert!(matches!(err, DeviceError::Core(_)));
    }

    #[test]
    fn test_not_authorized_display_uses_prompt() {
        let err = DeviceError::NotAuthorized(DeviceStatus::NotAuthorizedDeviceInUseByAnotherHost);
        assert_eq!(
            err.to_string(),
            "Not authorized: The device is in use by another host."
        );
        assert!(err.is_terminal());
    }
}
