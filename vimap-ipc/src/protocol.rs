//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the coordinator to worker processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputMessage {
    /// One unit of work, tagged with its coordinator-assigned identifier
    Item { id: u64, payload: JsonValue },

    /// End of stream. Exactly one is sent per worker on shutdown.
    Sentinel,
}

impl InputMessage {
    pub fn item(id: u64, payload: JsonValue) -> Self {
        InputMessage::Item { id, payload }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, InputMessage::Sentinel)
    }
}

/// Messages sent from worker processes back to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    /// Identifier of the item the result belongs to. `None` only for a
    /// failure raised before the worker consumed any item.
    pub id: Option<u64>,
    pub result: WorkResult,
}

impl OutputMessage {
    /// Create a successful output for item `id`
    pub fn output(id: u64, value: JsonValue) -> Self {
        Self {
            id: Some(id),
            result: WorkResult::Output { value },
        }
    }

    /// Create a failure, tagged with whatever item the worker was holding
    pub fn failure(id: Option<u64>, error: WorkerFailure) -> Self {
        Self {
            id,
            result: WorkResult::Failure { error },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, WorkResult::Failure { .. })
    }
}

/// What a worker process writes on its stdout pipe
///
/// A process worker asks for input with `Demand` before each item it
/// wants, so at most one item ever sits in a worker's stdin pipe and the
/// coordinator's spool depth stays meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Ready for the next input message
    Demand,

    /// A tagged output or failure
    Result { message: OutputMessage },
}

/// Tagged result union carried on the output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkResult {
    Output { value: JsonValue },
    Failure { error: WorkerFailure },
}

/// Why a worker stopped producing results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum WorkerFailure {
    /// The transform returned an error for an item
    TransformFailed { error: String },

    /// The transform broke the one-in/one-out discipline
    ProtocolViolation { error: String },

    /// The transform panicked
    WorkerPanic { error: String },

    /// The transform could not be constructed from its init arguments
    InitializationFailed { error: String },

    /// No transform is registered under the requested name
    UnknownTransform { name: String },

    /// Reading from or writing to a channel failed
    CommunicationError { error: String },
}

impl WorkerFailure {
    /// Whether the failure is a contract bug in the transform rather than a
    /// problem with the data it was given
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, WorkerFailure::ProtocolViolation { .. })
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::TransformFailed { error } => {
                write!(f, "Transform failed: {}", error)
            }
            WorkerFailure::ProtocolViolation { error } => {
                write!(f, "Protocol violation: {}", error)
            }
            WorkerFailure::WorkerPanic { error } => write!(f, "Worker panic: {}", error),
            WorkerFailure::InitializationFailed { error } => {
                write!(f, "Worker initialization failed: {}", error)
            }
            WorkerFailure::UnknownTransform { name } => {
                write!(f, "Unknown transform: {}", name)
            }
            WorkerFailure::CommunicationError { error } => {
                write!(f, "Communication error: {}", error)
            }
        }
    }
}

impl std::error::Error for WorkerFailure {}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }

    pub fn into_message(self) -> T {
        self.message
    }
}
