//! The result correlator: the coordinator's main loop
//!
//! Consuming a [`ZipInOut`] drives the pool. Each turn tops up the input
//! channel, waits briefly for one result and matches it against the pending
//! table. Failures are logged and never reach the caller.

use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::error::PoolError;
use crate::pool::Pool;

/// Lazy sequence of `(original, output)` pairs
///
/// Ends once every issued item is resolved or no worker is left to
/// resolve the rest.
pub struct ZipInOut<'p, T, O> {
    pool: &'p mut Pool<T, O>,
    close_if_done: bool,
    started: bool,
    done: bool,
}

impl<'p, T, O> ZipInOut<'p, T, O>
where
    T: Send + 'static,
    O: DeserializeOwned,
{
    pub(crate) fn new(pool: &'p mut Pool<T, O>, close_if_done: bool) -> Self {
        Self {
            pool,
            close_if_done,
            started: false,
            done: false,
        }
    }

    /// The next matched pair, or `None` when the loop is over
    pub async fn next(&mut self) -> Result<Option<(T, O)>, PoolError> {
        if self.done {
            return Ok(None);
        }

        if !self.started {
            if !self.pool.is_forked() {
                return Err(PoolError::NotForked);
            }
            self.started = true;
            self.spool().await?;
        }

        let poll_interval = self.pool.config().result_poll_interval;
        while self.pool.should_continue() {
            self.spool().await?;

            let received = match self.pool.channels.output.recv_timeout(poll_interval).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Failed to receive from output channel: {}", e);
                    return Err(e.into());
                }
            };

            if let Some(message) = received {
                if let Some(pair) = self.pool.correlate(message)? {
                    return Ok(Some(pair));
                }
            }
        }

        debug!(stats = ?self.pool.stats(), "Result loop finished");
        self.done = true;
        if self.close_if_done {
            self.pool.finish().await?;
        }
        Ok(None)
    }

    /// Drain every remaining pair
    pub async fn collect(mut self) -> Result<Vec<(T, O)>, PoolError> {
        let mut pairs = Vec::new();
        while let Some(pair) = self.next().await? {
            pairs.push(pair);
        }
        Ok(pairs)
    }

    /// The remaining pairs as a stream
    pub fn into_stream(self) -> impl Stream<Item = Result<(T, O), PoolError>> + 'p
    where
        T: 'p,
        O: 'p,
    {
        stream::try_unfold(self, |mut zip| async move {
            let next = zip.next().await?;
            Ok::<_, PoolError>(next.map(|pair| (pair, zip)))
        })
    }

    async fn spool(&mut self) -> Result<(), PoolError> {
        let exhausted = self.pool.spool()?;
        if exhausted && self.close_if_done {
            self.pool.finish().await?;
        }
        Ok(())
    }
}
