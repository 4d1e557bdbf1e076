//! Common types used throughout the protocol

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Malformed hex or byte input handed to the codec
    #[error("Format error: {0}")]
    Format(String),

    /// Outgoing command cannot be built from its template
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Operation cancelled by disconnect")]
    Cancelled,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::Format(err.to_string())
    }
}

/// Function byte of a standard frame (offset 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// Device status query (and its response)
    Query,
    /// Device status set (and its acknowledgement)
    Control,
    /// Anything the device is not documented to send
    Other(u8),
}

impl FunctionCode {
    pub const QUERY: u8 = 0x01;
    pub const CONTROL: u8 = 0x02;

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            FunctionCode::Query => Self::QUERY,
            FunctionCode::Control => Self::CONTROL,
            FunctionCode::Other(v) => v,
        }
    }
}

impl From<u8> for FunctionCode {
    fn from(value: u8) -> Self {
        match value {
            Self::QUERY => FunctionCode::Query,
            Self::CONTROL => FunctionCode::Control,
            v => FunctionCode::Other(v),
        }
    }
}
