//! Bounded hand-off queue between a driver callback and a consumer thread.
//!
//! The producer side never blocks: when the queue is full the incoming item
//! is dropped and `put` returns `false`. The consumer blocks up to a timeout.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default capacity used by the thermal pipeline.
pub const DEFAULT_CAPACITY: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("all producers disconnected")]
    Disconnected,
}

/// Consumer end of the hand-off queue. Owns the receiver.
pub struct HandoffQueue<T> {
    rx: Receiver<T>,
    producer: Producer<T>,
    capacity: usize,
}

/// Cheap, cloneable producer handle handed to the driver callback.
pub struct Producer<T> {
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> Producer<T> {
    /// Enqueue without blocking. Returns `false` if the item was dropped.
    pub fn put(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of items dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> HandoffQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            rx,
            producer: Producer {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            capacity,
        }
    }

    /// A producer handle for the callback context.
    pub fn producer(&self) -> Producer<T> {
        self.producer.clone()
    }

    /// Non-blocking put through the queue's own producer.
    pub fn put(&self, item: T) -> bool {
        self.producer.put(item)
    }

    /// Block up to `timeout` for the next item.
    pub fn get(&self, timeout: Duration) -> Result<T, QueueError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => QueueError::Timeout(timeout),
            RecvTimeoutError::Disconnected => QueueError::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.producer.dropped()
    }
}
