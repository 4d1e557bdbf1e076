//! Error types for the device layer

use thiserror::Error;

/// Errors raised by [`crate::MiyaDevice`] and its configuration
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Codec or transport failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] miya_protocol::ProtocolError),

    /// Command name not in the resolved table
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be read
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON
    #[error("Failed to parse config {path}: {source}")]
    ConfigJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DeviceError {
    /// Whether the error means the device is currently unreachable
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            DeviceError::Protocol(miya_protocol::ProtocolError::NotConnected)
        )
    }
}
