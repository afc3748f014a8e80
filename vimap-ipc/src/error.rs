//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error, e.g. a broken pipe to a dead worker
    #[error("IO error: {0}")]
    IoError(String),

    /// The other end closed its side of the pipe
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

}

impl IpcError {
    /// Whether the stream can no longer be trusted; malformed single
    /// lines are not fatal
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::ProtocolVersionMismatch { .. })
    }

    /// Whether the peer is gone (closed pipe or broken pipe)
    pub fn is_disconnect(&self) -> bool {
        matches!(self, IpcError::ConnectionClosed | IpcError::IoError(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
