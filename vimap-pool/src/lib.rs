//! Vimap worker pool
//!
//! A coordinator that streams inputs through a fixed pool of workers and
//! yields `(input, output)` pairs as results come back in any order.
//! Workers run either as blocking tasks in this process ([`TaskLauncher`])
//! or as child processes speaking line-delimited JSON ([`ProcessLauncher`]).

pub mod bridge;
pub mod channel;
pub mod correlate;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod pool;
pub mod process;
pub mod spool;
pub mod task;
pub mod transform;
pub mod worker;

// Re-export main types
pub use bridge::{run_worker, BridgeState, Inputs, WorkerBridge, WorkerEndpoint, WorkerExit};
pub use channel::{Channel, ChannelError, ChannelPair};
pub use correlate::ZipInOut;
pub use error::{PoolError, TransformError};
pub use lifecycle::{PoolLifecycle, WorkerHandle, WorkerLauncher};
pub use pool::{Pool, PoolStats};
pub use process::ProcessLauncher;
pub use spool::{spool_capacity, InFlightCounter, InputSpooler, Item, PendingTable};
pub use task::{SharedEndpoint, TaskLauncher};
pub use transform::{
    from_fn, try_from_fn, InitArgs, OutputIter, Transform, TransformRegistry, WorkerSpec,
};
pub use worker::{worker_main, PipeEndpoint, WorkerOptions};

// Re-export configuration used to build pools
pub use vimap_config::PoolConfig;
