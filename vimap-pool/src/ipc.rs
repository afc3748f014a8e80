//! Wire types shared with worker processes

pub use vimap_ipc::{
    InputMessage, IpcError, MessageEnvelope, OutputMessage, WorkResult, WorkerEvent, WorkerFailure,
    IPC_PROTOCOL_VERSION,
};
