//! Micro-batching of validated events in front of the sink.
//!
//! Exactly one batch is open at a time. It is flushed when it reaches `max_size` items or
//! when `max_wait` has elapsed since its first item was added, whichever happens first.
//! Every caller gets a [`PendingWrite`] resolved once its batch was written.
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

use crate::event::NormalizedEvent;
use crate::writer::{ResolvedWrite, SinkWriter, WriteOutcome};

const BATCH_FLUSHES_TOTAL: &str = "ingest_batch_flushes_total";
const BATCH_SIZE: &str = "ingest_batch_size";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("accumulator is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Collecting,
    Flushing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// An event waiting in a batch, with the channel its result is sent on.
pub struct BatchItem {
    pub event: NormalizedEvent,
    pub responder: oneshot::Sender<ResolvedWrite>,
}

struct Batch {
    id: u64,
    state: BatchState,
    items: Vec<BatchItem>,
}

impl Batch {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: BatchState::Collecting,
            items: Vec::new(),
        }
    }

    fn finish(&mut self) {
        self.state = BatchState::Closed;
        debug!(batch_id = self.id, state = ?self.state, "batch written");
    }
}

struct Inner {
    // Always Collecting, until shutdown marks it Closed
    open: Batch,
}

impl Inner {
    /// Replace the open batch with a fresh one and return the old one, ready to flush.
    fn seal(&mut self) -> Batch {
        let next = Batch::new(self.open.id + 1);
        let mut sealed = std::mem::replace(&mut self.open, next);
        sealed.state = BatchState::Flushing;
        sealed
    }
}

/// Handle on the eventual result of an added event.
///
/// Dropping it abandons the wait only: the event stays in its batch and is written anyway.
pub struct PendingWrite {
    batch_id: u64,
    receiver: oneshot::Receiver<ResolvedWrite>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub async fn wait(self) -> ResolvedWrite {
        match self.receiver.await {
            Ok(resolved) => resolved,
            // Only happens if the flush task died before resolving its items
            Err(_) => ResolvedWrite {
                outcome: WriteOutcome::TransientFailure("batch write was abandoned".to_string()),
                batch_id: self.batch_id,
                latency: Duration::ZERO,
            },
        }
    }
}

#[derive(Clone)]
pub struct BatchAccumulator {
    inner: Arc<Mutex<Inner>>,
    writer: SinkWriter,
    tracker: TaskTracker,
    max_size: usize,
    max_wait: Duration,
}

impl BatchAccumulator {
    pub fn new(writer: SinkWriter, max_size: usize, max_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                open: Batch::new(0),
            })),
            writer,
            tracker: TaskTracker::new(),
            max_size: max_size.max(1),
            max_wait,
        }
    }

    /// Add an event to the open batch, flushing it if it is now full.
    pub async fn add(&self, event: NormalizedEvent) -> Result<PendingWrite, AccumulatorError> {
        let (responder, receiver) = oneshot::channel();

        let mut inner = self.inner.lock().await;
        if inner.open.state == BatchState::Closed {
            return Err(AccumulatorError::Closed);
        }

        let batch_id = inner.open.id;
        let first_item = inner.open.items.is_empty();
        inner.open.items.push(BatchItem { event, responder });

        if inner.open.items.len() >= self.max_size {
            // Registered on the tracker before the lock is released, so shutdown waits for it
            let sealed = inner.seal();
            self.flush(sealed, FlushTrigger::Size);
        } else if first_item {
            drop(inner);
            self.arm_timer(batch_id);
        }

        Ok(PendingWrite { batch_id, receiver })
    }

    fn arm_timer(&self, batch_id: u64) {
        let accumulator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(accumulator.max_wait).await;

            let mut inner = accumulator.inner.lock().await;
            // The batch this timer was armed for may have been flushed already
            if inner.open.state != BatchState::Collecting
                || inner.open.id != batch_id
                || inner.open.items.is_empty()
            {
                return;
            }
            let sealed = inner.seal();
            accumulator.flush(sealed, FlushTrigger::Timer);
        });
    }

    fn flush(&self, mut batch: Batch, trigger: FlushTrigger) {
        counter!(BATCH_FLUSHES_TOTAL, "trigger" => trigger.as_str()).increment(1);
        histogram!(BATCH_SIZE).record(batch.items.len() as f64);
        debug!(
            batch_id = batch.id,
            size = batch.items.len(),
            trigger = trigger.as_str(),
            "flushing batch"
        );

        let writer = self.writer.clone();
        self.tracker.spawn(async move {
            let items = std::mem::take(&mut batch.items);
            writer.write(batch.id, items).await;
            batch.finish();
        });
    }

    /// Stop accepting events, flush the open batch and wait for every flush in flight.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        let sealed = {
            let mut inner = self.inner.lock().await;
            if inner.open.state == BatchState::Closed {
                None
            } else {
                let sealed = (!inner.open.items.is_empty()).then(|| inner.seal());
                inner.open.state = BatchState::Closed;
                sealed
            }
        };

        if let Some(batch) = sealed {
            info!(size = batch.items.len(), "flushing open batch before shutdown");
            self.flush(batch, FlushTrigger::Shutdown);
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("all batches written");
    }
}
