//! Child-process side of a subprocess worker
//!
//! The worker reads input envelopes from stdin and writes demands and
//! results to stdout. Logging must go to stderr.

use std::cell::Cell;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info};
use vimap_ipc::{InputMessage, IpcError, MessageEnvelope, OutputMessage, StdioTransport, WorkerEvent};

use crate::bridge::{run_worker, WorkerEndpoint, WorkerExit};
use crate::channel::{Channel, ChannelError};
use crate::error::PoolError;
use crate::transform::{TransformRegistry, WorkerSpec};

/// Exit status after end of stream
pub const EXIT_FINISHED: i32 = 0;
/// Exit status after a failure was reported to the coordinator
pub const EXIT_FAILED: i32 = 1;
/// Exit status after a pipe broke
pub const EXIT_CHANNEL_ERROR: i32 = 2;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: usize,
    pub spec: WorkerSpec,
    pub poll_interval: Duration,
}

/// Worker-side endpoint over the local channels that mirror stdin/stdout
///
/// Sends a `Demand` before waiting for input, once per item, so the
/// coordinator only ever writes an item to a worker that asked for one.
pub struct PipeEndpoint {
    input: Channel<InputMessage>,
    events: Channel<WorkerEvent>,
    runtime: Handle,
    demanded: Cell<bool>,
}

impl PipeEndpoint {
    pub fn new(input: Channel<InputMessage>, events: Channel<WorkerEvent>, runtime: Handle) -> Self {
        Self {
            input,
            events,
            runtime,
            demanded: Cell::new(false),
        }
    }
}

impl WorkerEndpoint for PipeEndpoint {
    fn receive(&self, timeout: Duration) -> Result<Option<InputMessage>, ChannelError> {
        if !self.demanded.get() {
            self.events.try_send(WorkerEvent::Demand)?;
            self.demanded.set(true);
        }

        let message = self.input.recv_timeout_blocking(&self.runtime, timeout)?;
        if message.is_some() {
            self.demanded.set(false);
        }
        Ok(message)
    }

    fn emit(&self, message: OutputMessage) -> Result<(), ChannelError> {
        self.events.try_send(WorkerEvent::Result { message })
    }
}

/// Run a worker over stdin/stdout and return the process exit status
///
/// Callers should end the process with the returned status rather than
/// returning from `main`, since a pending stdin read cannot be cancelled.
pub async fn worker_main(options: WorkerOptions, registry: TransformRegistry) -> i32 {
    let worker_id = options.worker_id;
    info!(worker_id, transform = %options.spec.transform, "Starting worker process");

    match serve(options, registry).await {
        Ok(WorkerExit::Finished) => {
            info!(worker_id, "Worker shutting down");
            EXIT_FINISHED
        }
        Ok(WorkerExit::Failed(failure)) => {
            info!(worker_id, "Worker stopped after failure: {}", failure);
            EXIT_FAILED
        }
        Err(e) => {
            error!(worker_id, "Worker communication failed: {}", e);
            EXIT_CHANNEL_ERROR
        }
    }
}

async fn serve(options: WorkerOptions, registry: TransformRegistry) -> Result<WorkerExit, PoolError> {
    let (mut reader, mut writer) = StdioTransport::stdio().into_split();
    let input: Channel<InputMessage> = Channel::unbounded();
    let events: Channel<WorkerEvent> = Channel::unbounded();
    let worker_id = options.worker_id;

    let stdin_task = tokio::spawn({
        let input = input.clone();
        async move {
            loop {
                match reader.receive::<InputMessage>().await {
                    Ok(envelope) => {
                        if input.send(envelope.into_message()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_disconnect() => {
                        debug!(worker_id, "Stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!(worker_id, "Failed to read from stdin: {}", e);
                        break;
                    }
                }
            }
            input.close();
        }
    });

    let stdout_task = tokio::spawn({
        let events = events.clone();
        async move {
            while let Ok(event) = events.recv().await {
                if let Err(e) = writer.send(&MessageEnvelope::new(event)).await {
                    events.close();
                    return Err(e);
                }
            }
            Ok::<(), IpcError>(())
        }
    });

    let runtime = Handle::current();
    let endpoint = PipeEndpoint::new(input, events.clone(), runtime);
    let exit = tokio::task::spawn_blocking(move || {
        run_worker(
            options.worker_id,
            &options.spec,
            &registry,
            &endpoint,
            options.poll_interval,
        )
    })
    .await
    .map_err(|e| PoolError::JoinError(e.to_string()))?;

    events.close();
    let written = stdout_task
        .await
        .map_err(|e| PoolError::JoinError(e.to_string()))?;
    stdin_task.abort();

    written?;
    Ok(exit?)
}
