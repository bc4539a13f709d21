use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::queue::QueueReceiver;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_wait_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_wait_time: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Pulls items off a queue and groups them into batches that close on
/// size or on the flush timer, whichever comes first.
#[derive(Debug)]
pub struct BatchCollector<T> {
    receiver: QueueReceiver<T>,
    config: BatchConfig,
}

impl<T> BatchCollector<T> {
    pub fn new(receiver: QueueReceiver<T>, config: BatchConfig) -> Self {
        Self { receiver, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<Vec<T>> {
        self.next_batch_weighted(cancel, |_| 1).await
    }

    /// Waits for the first item, then keeps collecting until the summed
    /// weight reaches `max_size` or `max_wait_time` has passed since that
    /// first item. Returns `None` once cancelled or closed with nothing
    /// pending; a partial batch is returned on cancellation.
    pub async fn next_batch_weighted<F>(
        &mut self,
        cancel: &CancellationToken,
        weight: F,
    ) -> Option<Vec<T>>
    where
        F: Fn(&T) -> usize,
    {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            item = self.receiver.recv() => item?,
        };

        let mut size = weight(&first);
        let mut batch = vec![first];
        let deadline = Instant::now() + self.config.max_wait_time;

        while size < self.config.max_size {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.receiver.recv() => match item {
                    Some(item) => {
                        size += weight(&item);
                        batch.push(item);
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => break,
            }
        }

        Some(batch)
    }

    /// Drain whatever is still queued without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut rest = Vec::new();
        while let Some(item) = self.receiver.try_recv() {
            rest.push(item);
        }
        rest
    }
}
