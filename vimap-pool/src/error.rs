//! Error types for the worker pool

use thiserror::Error;

use crate::channel::ChannelError;

/// Pool errors surfaced to the caller
///
/// Worker-side failures (a transform erroring, panicking or breaking the
/// one-in/one-out contract) are not represented here: they travel as
/// [`vimap_ipc::WorkerFailure`] messages and are logged and dropped by the
/// correlator.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool has not been forked")]
    NotForked,

    #[error("Pool has already been forked")]
    AlreadyForked,

    #[error("Pool has already been finished")]
    PoolFinished,

    #[error("Pool has no workers configured")]
    NoWorkers,

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Failed to spawn worker: {0}")]
    SpawnError(String),

    #[error("Channel error: {0}")]
    ChannelError(#[from] ChannelError),

    #[error("IPC error: {0}")]
    IpcError(#[from] vimap_ipc::IpcError),

    #[error("Failed to serialize input: {0}")]
    SerializationError(String),

    #[error("Failed to decode output for item {id}: {message}")]
    OutputDecodeError { id: u64, message: String },

    #[error("Worker join failed: {0}")]
    JoinError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] vimap_config::ConfigError),
}

/// Error a transform yields for an item it cannot process
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct TransformError {
    message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for TransformError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TransformError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
