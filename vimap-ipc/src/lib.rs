//! Inter-process communication for vimap
//!
//! This crate provides the message types exchanged between the pool
//! coordinator and its worker processes, plus the line-delimited JSON
//! transports used when workers run as separate OS processes.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    InputMessage, MessageEnvelope, OutputMessage, WorkResult, WorkerEvent, WorkerFailure,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{
    ChildProcessTransport, EnvelopeReader, EnvelopeWriter, LineTransport, StdioTransport,
};
