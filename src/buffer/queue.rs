use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::error::BufferError;

/// Upper bound so a typo in config cannot allocate an absurd channel.
const MAX_CAPACITY: usize = 10_000_000;

#[derive(Debug, Default)]
pub struct QueueStats {
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer half of a bounded queue. Pushing never waits: a full queue
/// drops the item and counts it.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    stats: Arc<QueueStats>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
}

pub fn bounded<T>(capacity: usize) -> Result<(QueueSender<T>, QueueReceiver<T>), BufferError> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(BufferError::InvalidCapacity { capacity });
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((
        QueueSender {
            tx,
            stats: Arc::new(QueueStats::default()),
        },
        QueueReceiver { rx },
    ))
}

impl<T> QueueSender<T> {
    #[inline]
    pub fn try_push(&self, item: T) -> Result<(), BufferError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Closed)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

impl<T> QueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
