//! Worker-side bridge between the input channel and a transform
//!
//! The bridge turns timeout-polled channel receipt into the pull sequence a
//! transform iterates over, then re-tags whatever the transform produces
//! with the identifier of the item it is holding.
//!
//! ```text
//! AWAITING_ITEM --item--> HAS_ITEM --output--> AWAITING_ITEM
//!       |                    |
//!       +------sentinel------+--> TERMINATED
//! ```

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};
use vimap_ipc::{InputMessage, OutputMessage, WorkerFailure};

use crate::channel::ChannelError;
use crate::error::TransformError;
use crate::transform::{Transform, TransformRegistry, WorkerSpec};

/// Where a worker reads inputs from and writes results to
///
/// Both calls block the current thread; workers run on blocking threads.
pub trait WorkerEndpoint {
    /// Wait at most `timeout` for the next input message
    fn receive(&self, timeout: Duration) -> Result<Option<InputMessage>, ChannelError>;

    fn emit(&self, message: OutputMessage) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    AwaitingItem,
    HasItem(u64),
    Terminated,
}

/// How a worker's bridge loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    /// The transform finished after end of stream
    Finished,
    /// A failure was reported on the output channel and the worker stopped
    Failed(WorkerFailure),
}

pub struct WorkerBridge<'e> {
    worker_id: usize,
    endpoint: &'e dyn WorkerEndpoint,
    poll_interval: Duration,
    current: Cell<Option<u64>>,
    terminated: Cell<bool>,
    channel_error: Cell<Option<ChannelError>>,
}

impl<'e> WorkerBridge<'e> {
    pub fn new(worker_id: usize, endpoint: &'e dyn WorkerEndpoint, poll_interval: Duration) -> Self {
        Self {
            worker_id,
            endpoint,
            poll_interval,
            current: Cell::new(None),
            terminated: Cell::new(false),
            channel_error: Cell::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        match (self.terminated.get(), self.current.get()) {
            (true, _) => BridgeState::Terminated,
            (false, Some(id)) => BridgeState::HasItem(id),
            (false, None) => BridgeState::AwaitingItem,
        }
    }

    /// Drive `transform` until end of stream or the first failure
    ///
    /// A channel error on either side ends the loop with `Err`; transform
    /// errors, panics and contract breaches are emitted as a single
    /// `Failure` and end it with `Ok(WorkerExit::Failed)`.
    pub fn drive(&self, transform: &mut dyn Transform) -> Result<WorkerExit, ChannelError> {
        let inputs = Inputs { bridge: self };
        let mut outputs = match panic::catch_unwind(AssertUnwindSafe(move || transform.run(inputs))) {
            Ok(outputs) => outputs,
            Err(payload) => {
                return self.fail(WorkerFailure::WorkerPanic {
                    error: panic_message(payload.as_ref()),
                })
            }
        };

        loop {
            let next = panic::catch_unwind(AssertUnwindSafe(|| outputs.next()));

            if let Some(err) = self.channel_error.take() {
                error!(worker_id = self.worker_id, "Input channel failed: {}", err);
                return Err(err);
            }

            match next {
                Ok(Some(Ok(value))) => match self.current.take() {
                    Some(id) => self.endpoint.emit(OutputMessage::output(id, value))?,
                    None => {
                        return self.fail(WorkerFailure::ProtocolViolation {
                            error: "output produced without consuming a new input".to_string(),
                        })
                    }
                },
                Ok(Some(Err(err))) => {
                    return self.fail(WorkerFailure::TransformFailed {
                        error: err.to_string(),
                    })
                }
                Ok(None) => {
                    if !self.terminated.get() {
                        debug!(worker_id = self.worker_id, "Transform ended before end of stream");
                    }
                    return Ok(WorkerExit::Finished);
                }
                Err(payload) => {
                    return self.fail(WorkerFailure::WorkerPanic {
                        error: panic_message(payload.as_ref()),
                    })
                }
            }
        }
    }

    /// Emit `failure` tagged with whatever item is held
    fn fail(&self, failure: WorkerFailure) -> Result<WorkerExit, ChannelError> {
        let id = self.current.get();
        if failure.is_contract_violation() {
            error!(worker_id = self.worker_id, item_id = ?id, "{}", failure);
        } else {
            warn!(worker_id = self.worker_id, item_id = ?id, "{}", failure);
        }

        self.endpoint.emit(OutputMessage::failure(id, failure.clone()))?;
        self.terminated.set(true);
        Ok(WorkerExit::Failed(failure))
    }

    fn pull(&self) -> Option<JsonValue> {
        if self.terminated.get() {
            return None;
        }

        loop {
            match self.endpoint.receive(self.poll_interval) {
                Ok(None) => continue,
                Ok(Some(InputMessage::Item { id, payload })) => {
                    if let Some(dropped) = self.current.replace(Some(id)) {
                        debug!(worker_id = self.worker_id, item_id = dropped, "Item consumed without output");
                    }
                    return Some(payload);
                }
                Ok(Some(InputMessage::Sentinel)) => {
                    debug!(worker_id = self.worker_id, "Received sentinel");
                    self.terminated.set(true);
                    return None;
                }
                Err(err) => {
                    self.channel_error.set(Some(err));
                    self.terminated.set(true);
                    return None;
                }
            }
        }
    }
}

/// The pull sequence a transform consumes
///
/// Yields deserialized payloads until the worker's sentinel arrives.
/// Blocks between items, polling the input channel.
pub struct Inputs<'a> {
    bridge: &'a WorkerBridge<'a>,
}

impl<'a> Inputs<'a> {
    /// Identifier of the item most recently pulled and not yet answered
    pub fn current_id(&self) -> Option<u64> {
        self.bridge.current.get()
    }

    /// Decode every input as `T`
    pub fn typed<T>(self) -> impl Iterator<Item = Result<T, TransformError>> + 'a
    where
        T: DeserializeOwned + 'a,
    {
        self.map(|value| serde_json::from_value(value).map_err(TransformError::from))
    }
}

impl Iterator for Inputs<'_> {
    type Item = JsonValue;

    fn next(&mut self) -> Option<JsonValue> {
        self.bridge.pull()
    }
}

/// Build the transform named by `spec` and drive it to completion
///
/// A transform that cannot be built is reported as a failure with no item
/// identifier.
pub fn run_worker(
    worker_id: usize,
    spec: &WorkerSpec,
    registry: &TransformRegistry,
    endpoint: &dyn WorkerEndpoint,
    poll_interval: Duration,
) -> Result<WorkerExit, ChannelError> {
    let bridge = WorkerBridge::new(worker_id, endpoint, poll_interval);

    let mut transform = match registry.build(spec) {
        Ok(transform) => transform,
        Err(failure) => return bridge.fail(failure),
    };

    debug!(worker_id, transform = %spec.transform, "Worker started");
    let exit = bridge.drive(transform.as_mut())?;
    debug!(worker_id, ?exit, "Worker stopped");
    Ok(exit)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
