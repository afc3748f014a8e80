//! In-process workers: one blocking task per worker on the shared channels

use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use vimap_config::PoolConfig;
use vimap_ipc::{InputMessage, OutputMessage};

use crate::bridge::{run_worker, WorkerEndpoint, WorkerExit};
use crate::channel::{ChannelError, ChannelPair};
use crate::error::PoolError;
use crate::lifecycle::{WorkerHandle, WorkerLauncher};
use crate::transform::{TransformRegistry, WorkerSpec};

/// The shared channel pair as seen from a blocking worker thread
pub struct SharedEndpoint {
    channels: ChannelPair,
    runtime: Handle,
}

impl SharedEndpoint {
    pub fn new(channels: ChannelPair, runtime: Handle) -> Self {
        Self { channels, runtime }
    }
}

impl WorkerEndpoint for SharedEndpoint {
    fn receive(&self, timeout: Duration) -> Result<Option<InputMessage>, ChannelError> {
        self.channels.input.recv_timeout_blocking(&self.runtime, timeout)
    }

    fn emit(&self, message: OutputMessage) -> Result<(), ChannelError> {
        self.channels.output.try_send(message)
    }
}

/// Launches workers as tokio blocking tasks in the current process
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    registry: TransformRegistry,
}

impl TaskLauncher {
    pub fn new(registry: TransformRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(
        &self,
        index: usize,
        spec: &WorkerSpec,
        channels: &ChannelPair,
        config: &PoolConfig,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let endpoint = SharedEndpoint::new(channels.clone(), Handle::current());
        let registry = self.registry.clone();
        let spec = spec.clone();
        let poll_interval = config.worker_poll_interval;

        let task = tokio::task::spawn_blocking(move || {
            let result = run_worker(index, &spec, &registry, &endpoint, poll_interval);
            if let Err(e) = &result {
                error!(worker_id = index, "Worker channel failure: {}", e);
            }
            result
        });

        Ok(Box::new(TaskWorker {
            id: index,
            task: Some(task),
        }))
    }
}

struct TaskWorker {
    id: usize,
    task: Option<JoinHandle<Result<WorkerExit, ChannelError>>>,
}

#[async_trait]
impl WorkerHandle for TaskWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn is_alive(&mut self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    async fn join(&mut self) -> Result<(), PoolError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let result = task.await;
        self.task = None;
        match result {
            Ok(Ok(exit)) => {
                debug!(worker_id = self.id, ?exit, "Worker joined");
                Ok(())
            }
            // already logged by the worker
            Ok(Err(_)) => Ok(()),
            Err(e) => Err(PoolError::JoinError(e.to_string())),
        }
    }

    async fn kill(&mut self) -> Result<(), PoolError> {
        // A blocking task cannot be interrupted; detach it instead
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}
