//! Subprocess workers
//!
//! Each worker is a child process speaking the envelope line protocol on
//! its stdin/stdout. Per child the coordinator runs a feeder task, moving
//! one input message from the shared input channel to the child's stdin
//! for every `Demand` the child sends, and a reader task moving results
//! from the child's stdout to the shared output channel.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vimap_config::PoolConfig;
use vimap_ipc::{
    ChildProcessTransport, EnvelopeReader, EnvelopeWriter, InputMessage, MessageEnvelope,
    OutputMessage, WorkerEvent, WorkerFailure,
};

use crate::channel::Channel;
use crate::channel::ChannelPair;
use crate::error::PoolError;
use crate::lifecycle::{WorkerHandle, WorkerLauncher};
use crate::transform::WorkerSpec;

/// Launches workers by re-executing a worker program
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<String>,
    log_level: Option<String>,
}

impl ProcessLauncher {
    /// Run `program worker ...` for every worker
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: vec!["worker".to_string()],
            log_level: None,
        }
    }

    /// Launch workers from the running executable
    pub fn current_exe() -> Result<Self, PoolError> {
        let program = std::env::current_exe()
            .map_err(|e| PoolError::SpawnError(format!("Failed to get current exe: {}", e)))?;
        Ok(Self::new(program))
    }

    /// Replace the arguments placed before the worker options
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Log level passed on to workers
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    fn command(&self, index: usize, spec: &WorkerSpec, config: &PoolConfig) -> Result<Command, PoolError> {
        let init_args = serde_json::to_string(&spec.init_args)
            .map_err(|e| PoolError::SerializationError(e.to_string()))?;
        let init_kwargs = serde_json::to_string(&spec.init_kwargs)
            .map_err(|e| PoolError::SerializationError(e.to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--worker-id")
            .arg(index.to_string())
            .arg("--transform")
            .arg(&spec.transform)
            .arg("--init-args")
            .arg(init_args)
            .arg("--init-kwargs")
            .arg(init_kwargs)
            .arg("--poll-interval-ms")
            .arg(config.worker_poll_interval.as_millis().to_string());

        if let Some(level) = &self.log_level {
            cmd.arg("--log-level").arg(level);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        Ok(cmd)
    }

    async fn spawn_worker(
        &self,
        index: usize,
        spec: &WorkerSpec,
        channels: &ChannelPair,
        config: &PoolConfig,
    ) -> Result<ProcessWorker, PoolError> {
        debug!(worker_id = index, program = %self.program.display(), "Spawning worker process");

        let mut child = self
            .command(index, spec, config)?
            .spawn()
            .map_err(|e| PoolError::SpawnError(format!("Failed to spawn worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::SpawnError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::SpawnError("Failed to get stdout".to_string()))?;

        let (reader, writer) = ChildProcessTransport::from_child(stdin, stdout).into_split();
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let feeder = tokio::spawn(feed_worker(
            index,
            writer,
            channels.input.clone(),
            demand_rx,
            done_rx,
        ));
        let reader = tokio::spawn(read_worker(
            index,
            reader,
            channels.output.clone(),
            demand_tx,
            done_tx,
        ));

        info!(worker_id = index, pid = ?child.id(), "Worker process started");
        Ok(ProcessWorker {
            id: index,
            child,
            exited: false,
            feeder: Some(feeder),
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        index: usize,
        spec: &WorkerSpec,
        channels: &ChannelPair,
        config: &PoolConfig,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let worker = self.spawn_worker(index, spec, channels, config).await?;
        Ok(Box::new(worker))
    }
}

/// Forward one input message per demand until a sentinel is delivered or
/// the child goes away
async fn feed_worker(
    worker_id: usize,
    mut writer: EnvelopeWriter<ChildStdin>,
    input: Channel<InputMessage>,
    mut demands: mpsc::UnboundedReceiver<()>,
    mut reader_done: oneshot::Receiver<()>,
) {
    while demands.recv().await.is_some() {
        let message = tokio::select! {
            received = input.recv() => match received {
                Ok(message) => message,
                Err(_) => break,
            },
            _ = &mut reader_done => break,
        };

        let sentinel = message.is_sentinel();
        let envelope = MessageEnvelope::new(message);
        if let Err(e) = writer.send(&envelope).await {
            if e.is_disconnect() {
                debug!(worker_id, "Worker stdin closed (worker likely terminated)");
            } else {
                error!(worker_id, "Failed to write to worker stdin: {}", e);
            }
            // give the undelivered message to a live worker
            if input.try_send(envelope.into_message()).is_err() {
                warn!(worker_id, "Input channel closed, message dropped");
            }
            break;
        }

        if sentinel {
            debug!(worker_id, "Sentinel delivered");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(worker_id, "Failed to close worker stdin: {}", e);
    }
}

/// Move results from the child's stdout to the output channel and demands
/// to the feeder, until stdout closes
///
/// A stream the coordinator cannot speak is reported as a communication
/// failure so the pool raises instead of waiting on the missing results.
async fn read_worker(
    worker_id: usize,
    mut reader: EnvelopeReader<ChildStdout>,
    output: Channel<OutputMessage>,
    demands: mpsc::UnboundedSender<()>,
    _done: oneshot::Sender<()>,
) {
    loop {
        match reader.receive::<WorkerEvent>().await {
            Ok(envelope) => match envelope.into_message() {
                WorkerEvent::Demand => {
                    // the feeder is gone once it has delivered the sentinel
                    let _ = demands.send(());
                }
                WorkerEvent::Result { message } => {
                    if output.send(message).await.is_err() {
                        warn!(worker_id, "Output channel closed");
                        break;
                    }
                }
            },
            Err(e) if e.is_disconnect() => {
                debug!(worker_id, "Worker stdout closed");
                break;
            }
            Err(e) if e.is_fatal() => {
                error!(worker_id, "Fatal error reading from worker: {}", e);
                let failure = WorkerFailure::CommunicationError {
                    error: e.to_string(),
                };
                if output.send(OutputMessage::failure(None, failure)).await.is_err() {
                    warn!(worker_id, "Output channel closed");
                }
                break;
            }
            Err(e) => {
                warn!(worker_id, "Failed to parse message from worker: {}", e);
            }
        }
    }
}

struct ProcessWorker {
    id: usize,
    child: Child,
    exited: bool,
    feeder: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessWorker {
    async fn drain(&mut self) -> Result<(), PoolError> {
        if let Some(reader) = self.reader.take() {
            reader.await.map_err(|e| PoolError::JoinError(e.to_string()))?;
        }
        if let Some(feeder) = self.feeder.take() {
            feeder.await.map_err(|e| PoolError::JoinError(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn id(&self) -> usize {
        self.id
    }

    /// Alive until the child has exited and all of its output is forwarded
    fn is_alive(&mut self) -> bool {
        if !self.exited {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker_id = self.id, %status, "Worker process exited");
                    self.exited = true;
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(worker_id = self.id, "Failed to poll worker process: {}", e);
                    return true;
                }
            }
        }

        self.reader.as_ref().is_some_and(|reader| !reader.is_finished())
    }

    async fn join(&mut self) -> Result<(), PoolError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| PoolError::JoinError(format!("Failed to wait for worker: {}", e)))?;
        self.exited = true;

        if status.success() {
            debug!(worker_id = self.id, "Worker process terminated gracefully");
        } else {
            warn!(worker_id = self.id, %status, "Worker process exited with failure");
        }

        self.drain().await
    }

    async fn kill(&mut self) -> Result<(), PoolError> {
        if let Err(e) = self.child.kill().await {
            debug!(worker_id = self.id, "Failed to kill worker process: {}", e);
        }
        self.exited = true;
        self.drain().await
    }
}
