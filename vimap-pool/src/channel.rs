//! The coordinator/worker channel pair
//!
//! Both channels are FIFO and multi-producer/multi-consumer. Receiving is
//! always bounded by a timeout; an empty channel is reported as `Ok(None)`,
//! never as an error.

use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use vimap_ipc::{InputMessage, OutputMessage};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// One FIFO channel. Clones share the same queue.
#[derive(Debug)]
pub struct Channel<M> {
    tx: async_channel::Sender<M>,
    rx: async_channel::Receiver<M>,
    report_depth: bool,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            report_depth: self.report_depth,
        }
    }
}

impl<M> Channel<M> {
    pub fn unbounded() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            report_depth: true,
        }
    }

    /// A channel whose depth cannot be queried, like a platform queue
    /// without a size call
    pub fn without_depth() -> Self {
        Self {
            report_depth: false,
            ..Self::unbounded()
        }
    }

    pub async fn send(&self, message: M) -> Result<(), ChannelError> {
        self.tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    /// Non-async send, usable from `Drop` and blocking threads. Never blocks
    /// since the channel is unbounded.
    pub fn try_send(&self, message: M) -> Result<(), ChannelError> {
        self.tx.try_send(message).map_err(|_| ChannelError::Closed)
    }

    /// Wait until a message arrives. Fails only once the channel is closed
    /// and drained.
    pub async fn recv(&self) -> Result<M, ChannelError> {
        self.rx.recv().await.map_err(|_| ChannelError::Closed)
    }

    /// Wait at most `timeout` for a message
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<M>, ChannelError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_elapsed) => Ok(None),
        }
    }

    /// [`recv_timeout`](Self::recv_timeout) for code running on a blocking
    /// thread of `runtime`
    pub fn recv_timeout_blocking(
        &self,
        runtime: &Handle,
        timeout: Duration,
    ) -> Result<Option<M>, ChannelError> {
        runtime.block_on(self.recv_timeout(timeout))
    }

    /// Number of queued messages, if this channel can report it
    pub fn depth(&self) -> Option<usize> {
        self.report_depth.then(|| self.rx.len())
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the channel. Queued messages can still be received.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Input channel (coordinator to workers) and output channel (workers to
/// coordinator)
#[derive(Debug, Clone)]
pub struct ChannelPair {
    pub input: Channel<InputMessage>,
    pub output: Channel<OutputMessage>,
}

impl ChannelPair {
    pub fn new(query_input_depth: bool) -> Self {
        let input = if query_input_depth {
            Channel::unbounded()
        } else {
            Channel::without_depth()
        };

        Self {
            input,
            output: Channel::unbounded(),
        }
    }
}

impl Default for ChannelPair {
    fn default() -> Self {
        Self::new(true)
    }
}
