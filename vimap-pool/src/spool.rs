//! Coordinator-side input bookkeeping: spooler, pending table and in-flight
//! counter
//!
//! All three are owned by the coordinator and never shared with workers.

use std::collections::{HashMap, VecDeque};

use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::PoolError;

/// One unit of work: the caller's original value and what is sent to a
/// worker for it
#[derive(Debug, Clone, PartialEq)]
pub struct Item<T> {
    pub id: u64,
    pub original: T,
    pub serialized: JsonValue,
}

/// A registered input sequence yielding `(original, serialized)` pairs
pub type InputSource<T> = Box<dyn Iterator<Item = Result<(T, JsonValue), PoolError>> + Send>;

/// Lazy concatenation of every registered input sequence
///
/// Identifiers are assigned as items are pulled, so they are strictly
/// increasing across all sequences ever registered.
pub struct InputSpooler<T> {
    sources: VecDeque<InputSource<T>>,
    next_id: u64,
}

impl<T> InputSpooler<T> {
    pub fn new() -> Self {
        Self {
            sources: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn register<I>(&mut self, source: I)
    where
        I: Iterator<Item = Result<(T, JsonValue), PoolError>> + Send + 'static,
    {
        self.sources.push_back(Box::new(source));
    }

    /// Pull the next item from the oldest unexhausted sequence
    ///
    /// A sequence that fails to produce an item (for example, a value that
    /// cannot be serialized) yields the error without consuming an id.
    pub fn next_item(&mut self) -> Option<Result<Item<T>, PoolError>> {
        while let Some(source) = self.sources.front_mut() {
            match source.next() {
                Some(Ok((original, serialized))) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    return Some(Ok(Item {
                        id,
                        original,
                        serialized,
                    }));
                }
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.sources.pop_front();
                }
            }
        }
        None
    }

    /// Whether any registered sequence might still have items
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Number of identifiers issued so far
    pub fn issued(&self) -> u64 {
        self.next_id
    }
}

impl<T> Default for InputSpooler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How many more items may be put on the input channel
///
/// `depth` is the channel's current size, or `None` where it cannot be
/// queried, in which case the channel is assumed empty.
pub fn spool_capacity(worker_count: usize, spool_factor: usize, depth: Option<usize>) -> usize {
    spool_factor
        .saturating_mul(worker_count)
        .saturating_sub(depth.unwrap_or(0))
}

/// Originals of every enqueued item still awaiting a result
#[derive(Debug)]
pub struct PendingTable<T> {
    entries: HashMap<u64, T>,
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: u64, original: T) {
        if self.entries.insert(id, original).is_some() {
            warn!(item_id = id, "Identifier enqueued twice");
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages sent to workers minus messages received from them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlightCounter {
    sent: u64,
    received: u64,
    in_flight: u64,
}

impl InFlightCounter {
    pub fn record_sent(&mut self) {
        self.sent += 1;
        self.in_flight += 1;
    }

    pub fn record_received(&mut self) {
        self.received += 1;
        match self.in_flight.checked_sub(1) {
            Some(n) => self.in_flight = n,
            // a worker failing before it took any item answers nothing we sent
            None => warn!(
                sent = self.sent,
                received = self.received,
                "Received more messages than were sent"
            ),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }
}
