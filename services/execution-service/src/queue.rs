//! Bounded drop-on-full queues between producers and workers

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Log the first drop and then every this many
const DROP_LOG_EVERY: u64 = 1_000;

/// Producer half of a bounded queue.
///
/// `offer` never waits: a full queue drops the item and counts it.
#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue without blocking. Returns `false` if the item was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    warn!("{} queue full, {} items dropped so far", self.name, dropped);
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} queue closed, item discarded", self.name);
                false
            }
        }
    }

    /// Items dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items waiting
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Bounded queue; the receiver goes to exactly one worker
pub fn bounded<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueSender {
            name,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Drop counts per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDrops {
    /// Order status reports
    pub order_updates: u64,
    /// Fills
    pub fills: u64,
    /// Position updates
    pub position_updates: u64,
    /// Ticks
    pub ticks: u64,
    /// Books
    pub books: u64,
}

impl QueueDrops {
    /// Sum across queues
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.order_updates + self.fills + self.position_updates + self.ticks + self.books
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (tx, mut rx) = bounded::<u32>("test", 2);
        assert!(tx.offer(1));
        assert!(tx.offer(2));
        assert!(!tx.offer(3));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(tx.depth(), 2);

        assert_eq!(rx.recv().await, Some(1));
        assert!(tx.offer(4));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(4));
        assert_eq!(tx.dropped(), 1);
    }

    #[test]
    fn test_closed_queue_is_not_a_drop() {
        let (tx, rx) = bounded::<u32>("test", 1);
        drop(rx);
        assert!(!tx.offer(1));
        assert_eq!(tx.dropped(), 0);
    }
}
