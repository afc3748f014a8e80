//! The pool coordinator
//!
//! A [`Pool`] owns the channel pair, the worker lifecycle and all input
//! bookkeeping. Only the coordinator task touches the pending table and the
//! in-flight counter; workers see nothing but the two channels.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};
use vimap_config::{PoolConfig, Validatable};
use vimap_ipc::{InputMessage, OutputMessage, WorkResult};

use crate::channel::ChannelPair;
use crate::correlate::ZipInOut;
use crate::error::PoolError;
use crate::lifecycle::{join_worker, PoolLifecycle, WorkerLauncher};
use crate::spool::{spool_capacity, InFlightCounter, InputSpooler, Item, PendingTable};
use crate::transform::WorkerSpec;

/// Snapshot of the coordinator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub issued: u64,
    pub pending: usize,
    pub sent: u64,
    pub received: u64,
    pub in_flight: u64,
    pub sentinel_broadcasts: usize,
    pub finished: bool,
}

/// A fixed pool of workers applying a transform to streamed inputs
///
/// `T` is the caller's input type, kept by the coordinator until its result
/// arrives. `O` is the type outputs are decoded into.
pub struct Pool<T, O = JsonValue> {
    config: PoolConfig,
    pub(crate) channels: ChannelPair,
    lifecycle: PoolLifecycle,
    spooler: InputSpooler<T>,
    pending: PendingTable<T>,
    in_flight: InFlightCounter,
    _output: PhantomData<fn() -> O>,
}

impl<T, O> Pool<T, O>
where
    T: Send + 'static,
    O: DeserializeOwned,
{
    /// One worker per descriptor
    pub fn new(specs: Vec<WorkerSpec>, launcher: Arc<dyn WorkerLauncher>, config: PoolConfig) -> Self {
        Self {
            channels: ChannelPair::new(config.query_input_depth),
            lifecycle: PoolLifecycle::new(specs, launcher),
            config,
            spooler: InputSpooler::new(),
            pending: PendingTable::new(),
            in_flight: InFlightCounter::default(),
            _output: PhantomData,
        }
    }

    /// `num_workers` copies of the same descriptor, defaulting to
    /// `config.worker_count`
    pub fn unlabeled(
        spec: WorkerSpec,
        num_workers: Option<usize>,
        launcher: Arc<dyn WorkerLauncher>,
        config: PoolConfig,
    ) -> Self {
        let count = num_workers.unwrap_or(config.worker_count);
        Self::new(vec![spec; count], launcher, config)
    }

    /// Construct and fork in one step
    pub async fn forked(
        specs: Vec<WorkerSpec>,
        launcher: Arc<dyn WorkerLauncher>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let mut pool = Self::new(specs, launcher, config);
        pool.fork().await?;
        Ok(pool)
    }

    /// Start every worker. Must be called before any input is processed.
    pub async fn fork(&mut self) -> Result<&mut Self, PoolError> {
        self.config.validate()?;
        self.lifecycle.fork(&self.channels, &self.config).await?;
        Ok(self)
    }

    /// Register a sequence for streaming submission
    ///
    /// Items are serialized as they are spooled. Part of the sequence is
    /// enqueued immediately.
    pub fn imap<I>(&mut self, inputs: I) -> Result<&mut Self, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Serialize,
    {
        self.register(inputs.into_iter().map(|original| {
            serde_json::to_value(&original)
                .map(|serialized| (original, serialized))
                .map_err(|e| PoolError::SerializationError(e.to_string()))
        }))
    }

    /// Register a sequence that already yields `(original, serialized)` pairs
    pub fn imap_pretransformed<I, S>(&mut self, inputs: I) -> Result<&mut Self, PoolError>
    where
        I: IntoIterator<Item = (T, S)>,
        I::IntoIter: Send + 'static,
        S: Serialize + 'static,
    {
        self.register(inputs.into_iter().map(|(original, serialized)| {
            serde_json::to_value(serialized)
                .map(|serialized| (original, serialized))
                .map_err(|e| PoolError::SerializationError(e.to_string()))
        }))
    }

    fn register<I>(&mut self, source: I) -> Result<&mut Self, PoolError>
    where
        I: Iterator<Item = Result<(T, JsonValue), PoolError>> + Send + 'static,
    {
        self.check_accepting()?;
        self.spooler.register(source);
        self.spool()?;
        Ok(self)
    }

    /// [`imap`](Self::imap) followed by enqueueing everything at once
    pub fn map<I>(&mut self, inputs: I) -> Result<&mut Self, PoolError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Serialize,
    {
        self.imap(inputs)?;
        self.enqueue_all()?;
        Ok(self)
    }

    pub fn map_pretransformed<I, S>(&mut self, inputs: I) -> Result<&mut Self, PoolError>
    where
        I: IntoIterator<Item = (T, S)>,
        I::IntoIter: Send + 'static,
        S: Serialize + 'static,
    {
        self.imap_pretransformed(inputs)?;
        self.enqueue_all()?;
        Ok(self)
    }

    /// Enqueue every remaining item of every registered sequence, ignoring
    /// the spool bound
    pub fn enqueue_all(&mut self) -> Result<(), PoolError> {
        self.check_accepting()?;
        while let Some(item) = self.spooler.next_item() {
            self.enqueue(item?)?;
        }
        Ok(())
    }

    /// Results as `(original, output)` pairs, shutting the pool down once
    /// input runs out if `close_if_done` is configured
    pub fn zip_in_out(&mut self) -> ZipInOut<'_, T, O> {
        let close_if_done = self.config.close_if_done;
        ZipInOut::new(self, close_if_done)
    }

    /// Results without shutting down afterwards, so more input can follow
    pub fn zip_in_out_keep_alive(&mut self) -> ZipInOut<'_, T, O> {
        ZipInOut::new(self, false)
    }

    pub fn zip_in_out_with(&mut self, close_if_done: bool) -> ZipInOut<'_, T, O> {
        ZipInOut::new(self, close_if_done)
    }

    /// Send one sentinel per worker and wait for all of them. Idempotent.
    pub async fn finish(&mut self) -> Result<(), PoolError> {
        self.lifecycle
            .shutdown(&self.channels, self.config.join_timeout)
            .await
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_forked(&self) -> bool {
        self.lifecycle.is_forked()
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.lifecycle.worker_count(),
            issued: self.spooler.issued(),
            pending: self.pending.len(),
            sent: self.in_flight.sent(),
            received: self.in_flight.received(),
            in_flight: self.in_flight.in_flight(),
            sentinel_broadcasts: self.lifecycle.sentinel_broadcasts(),
            finished: self.lifecycle.is_finished(),
        }
    }

    fn check_accepting(&self) -> Result<(), PoolError> {
        if self.lifecycle.is_finished() {
            return Err(PoolError::PoolFinished);
        }
        if !self.lifecycle.is_forked() {
            return Err(PoolError::NotForked);
        }
        Ok(())
    }

    /// Top the input channel up to `spool_factor * workers` items
    ///
    /// Returns `true` when the registered input ran out before the channel
    /// was full.
    pub(crate) fn spool(&mut self) -> Result<bool, PoolError> {
        if self.lifecycle.is_finished() {
            return Ok(false);
        }

        let capacity = spool_capacity(
            self.lifecycle.worker_count(),
            self.config.spool_factor,
            self.channels.input.depth(),
        );

        for _ in 0..capacity {
            match self.spooler.next_item() {
                Some(item) => self.enqueue(item?)?,
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    fn enqueue(&mut self, item: Item<T>) -> Result<(), PoolError> {
        let Item {
            id,
            original,
            serialized,
        } = item;

        if let Err(e) = self.channels.input.try_send(InputMessage::item(id, serialized)) {
            error!(item_id = id, "Failed to enqueue item: {}", e);
            return Err(e.into());
        }
        self.pending.insert(id, original);
        self.in_flight.record_sent();
        Ok(())
    }

    /// Match one message from the output channel against the pending table
    pub(crate) fn correlate(&mut self, message: OutputMessage) -> Result<Option<(T, O)>, PoolError> {
        self.in_flight.record_received();

        match message.result {
            WorkResult::Output { value } => {
                let Some(id) = message.id else {
                    warn!("Dropping output without an item identifier");
                    return Ok(None);
                };
                let Some(original) = self.pending.remove(id) else {
                    warn!(item_id = id, "Dropping output for unknown item");
                    return Ok(None);
                };

                let output = serde_json::from_value(value).map_err(|e| PoolError::OutputDecodeError {
                    id,
                    message: e.to_string(),
                })?;
                Ok(Some((original, output)))
            }
            WorkResult::Failure { error } => {
                match message.id {
                    Some(id) => {
                        if self.pending.remove(id).is_none() {
                            debug!(item_id = id, "Failure for unknown item");
                        }
                        warn!(item_id = id, "Worker failed, dropping item: {}", error);
                    }
                    None => warn!("Worker failed before consuming an item: {}", error),
                }
                Ok(None)
            }
        }
    }

    /// The correlator keeps going while results are owed and can still
    /// arrive
    ///
    /// Liveness is sampled before the output channel: a worker that sends
    /// its last message and then exits is either seen alive or its message
    /// is already queued.
    pub(crate) fn should_continue(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let alive = self.lifecycle.any_alive();
        alive || !self.channels.output.is_empty()
    }
}

impl<T, O> Drop for Pool<T, O> {
    fn drop(&mut self) {
        let workers = self.lifecycle.abandon(&self.channels);
        if workers.is_empty() {
            return;
        }

        warn!("Pool dropped without finish, stopping {} workers", workers.len());
        let join_timeout = self.config.join_timeout;
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for mut worker in workers {
                        if let Err(e) = join_worker(worker.as_mut(), join_timeout).await {
                            warn!(worker_id = worker.id(), "Failed to join worker: {}", e);
                        }
                    }
                });
            }
            Err(_) => debug!("No runtime to join workers on, detaching"),
        }
    }
}
