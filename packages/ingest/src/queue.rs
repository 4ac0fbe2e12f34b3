//! Bounded hand-off between fetch workers and the writer thread.
//!
//! A full queue suspends the sending worker until the writer pops an item.
//! That is the only backpressure point in the pipeline.
//!
//! Capacity is enforced by a slot semaphore in front of the channel. A
//! push takes a slot before counting the item as queued; a pop uncounts
//! the item before handing its slot back, so the occupancy counter can
//! never read above capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use eventsync_ingest_models::QueueItem;
use tokio::sync::{Semaphore, mpsc};

use crate::IngestError;

#[derive(Debug)]
struct Occupancy {
    slots: Semaphore,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    capacity: usize,
}

/// Sending half. Cloned into every worker.
#[derive(Debug, Clone)]
pub struct BoundedQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    occupancy: Arc<Occupancy>,
}

/// Receiving half, owned by the writer.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    occupancy: Arc<Occupancy>,
}

/// Creates a queue holding at most `capacity` items.
///
/// # Errors
///
/// Returns [`IngestError::Validation`] if `capacity` is 0.
pub fn bounded(capacity: usize) -> Result<(BoundedQueue, QueueReceiver), IngestError> {
    if capacity == 0 {
        return Err(IngestError::validation("queue_capacity must be at least 1"));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let occupancy = Arc::new(Occupancy {
        slots: Semaphore::new(capacity),
        queued: AtomicUsize::new(0),
        high_water: AtomicUsize::new(0),
        capacity,
    });
    Ok((
        BoundedQueue {
            tx,
            occupancy: Arc::clone(&occupancy),
        },
        QueueReceiver { rx, occupancy },
    ))
}

impl BoundedQueue {
    /// Pushes `item`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::QueueClosed`] if the receiver is gone.
    pub async fn push(&self, item: QueueItem) -> Result<(), IngestError> {
        let occupancy = &self.occupancy;
        occupancy
            .slots
            .acquire()
            .await
            .map_err(|_| IngestError::QueueClosed)?
            .forget();

        let queued = occupancy.queued.fetch_add(1, Ordering::SeqCst) + 1;
        occupancy.high_water.fetch_max(queued, Ordering::SeqCst);

        self.tx.send(item).map_err(|_| {
            occupancy.queued.fetch_sub(1, Ordering::SeqCst);
            occupancy.slots.add_permits(1);
            IngestError::QueueClosed
        })
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.occupancy.capacity
    }

    /// Items pushed and not yet popped.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.occupancy.queued.load(Ordering::SeqCst)
    }

    /// Largest number of items queued at once so far.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.occupancy.high_water.load(Ordering::SeqCst)
    }
}

impl QueueReceiver {
    /// Blocks the current thread until an item arrives.
    ///
    /// Returns `None` once every sender is dropped and the queue is empty.
    /// Must not be called from an async context.
    pub fn blocking_pop(&mut self) -> Option<QueueItem> {
        let item = self.rx.blocking_recv()?;
        self.occupancy.queued.fetch_sub(1, Ordering::SeqCst);
        self.occupancy.slots.add_permits(1);
        Some(item)
    }
}

impl Drop for QueueReceiver {
    /// Wakes senders waiting for a slot so they fail with
    /// [`IngestError::QueueClosed`].
    fn drop(&mut self) {
        self.occupancy.slots.close();
    }
}
