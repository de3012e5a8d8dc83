use std::fmt::Debug;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::async_queue::AsyncWorkQueue;
use crate::error::QueueError;
use crate::queue::WorkQueue;

/// Enqueues a batch in order, then signals end-of-stream once.
pub struct Producer<T> {
    queue: Arc<WorkQueue<T>>,
    delay: Duration,
}

impl<T: Debug> Producer<T> {
    pub fn new(queue: Arc<WorkQueue<T>>) -> Self {
        Self {
            queue,
            delay: Duration::ZERO,
        }
    }

    /// Pause between consecutive items.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns the number of items produced.
    ///
    /// If an enqueue fails the marker is not sent; the caller decides whether
    /// to cancel the queue.
    pub fn run<I>(self, items: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut produced = 0;
        for item in items {
            info!(?item, "producing");
            self.queue.enqueue(item)?;
            produced += 1;
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }
        self.queue.signal_shutdown()?;
        info!(produced, "production finished");
        Ok(produced)
    }
}

pub struct AsyncProducer<T> {
    queue: Arc<AsyncWorkQueue<T>>,
    delay: Duration,
}

impl<T: Debug> AsyncProducer<T> {
    pub fn new(queue: Arc<AsyncWorkQueue<T>>) -> Self {
        Self {
            queue,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn run<I>(self, items: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut produced = 0;
        for item in items {
            info!(?item, "producing");
            self.queue.enqueue(item).await?;
            produced += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        self.queue.signal_shutdown()?;
        info!(produced, "production finished");
        Ok(produced)
    }
}
