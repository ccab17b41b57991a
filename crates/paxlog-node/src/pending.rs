//! Pending value queue between submitters and the proposer task.
//!
//! Uses `crossbeam-queue::ArrayQueue` for a lock-free, bounded MPSC queue.
//! When the queue is full, `try_push` returns the item back to the caller
//! to signal backpressure, so `submit` never blocks.
//!
//! # Sizing
//!
//! Size the queue using Little's Law: `capacity = throughput * latency`.
//! At 20k values/sec and 25ms to decide: `capacity = 20_000 * 0.025 = 500`.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use paxlog_types::{Scn, Value, ValueId};
use tokio::sync::{Notify, oneshot};

use crate::SubmitError;

/// Result of attempting to push to a full queue.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was successfully enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

/// A submitted value and the channel its SCN is reported on.
#[derive(Debug)]
pub struct PendingValue {
    pub value: Value,
    pub ticket: oneshot::Sender<Scn>,
}

/// Bounded FIFO of submitted values with a wakeup for the proposer.
#[derive(Debug)]
pub struct PendingQueue {
    inner: ArrayQueue<PendingValue>,
    notify: Notify,
    closed: AtomicBool,
}

impl PendingQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Attempts to enqueue a value and wakes the proposer.
    pub fn try_push(&self, item: PendingValue) -> PushResult<PendingValue> {
        match self.inner.push(item) {
            Ok(()) => {
                self.notify.notify_one();
                PushResult::Ok
            }
            Err(item) => PushResult::Backpressure(item),
        }
    }

    pub fn try_pop(&self) -> Option<PendingValue> {
        self.inner.pop()
    }

    /// Resolves once a value was pushed since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Refuses further pushes. Queued values stay until popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Handle to a submitted value.
#[derive(Debug)]
pub struct Pending {
    id: ValueId,
    rx: oneshot::Receiver<Scn>,
}

impl Pending {
    pub(crate) fn new(id: ValueId, rx: oneshot::Receiver<Scn>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    /// Waits until the value is durably applied locally and returns the
    /// SCN it was bound to.
    pub async fn decided(self) -> Result<Scn, SubmitError> {
        self.rx.await.map_err(|_| SubmitError::ShutDown)
    }
}
