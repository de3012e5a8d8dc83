//! Work queue for tokio tasks.
//!
//! Same contract as [`crate::queue::WorkQueue`], but producers and consumers
//! suspend on `Notify` instead of blocking a thread. A `CancellationToken` is
//! raced against every suspension point.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::error::{QueueError, TryEnqueueError};
use crate::item::WorkItem;

struct State<T> {
    items: VecDeque<WorkItem<T>>,
    shutdown: bool,
}

pub struct AsyncWorkQueue<T> {
    // Never held across an await.
    state: Mutex<State<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: Option<usize>,
    cancel: CancellationToken,
}

impl<T> AsyncWorkQueue<T> {
    pub fn new(capacity: Option<usize>) -> Result<Self, QueueError> {
        if capacity == Some(0) {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
            cancel: CancellationToken::new(),
        })
    }

    pub fn bounded(capacity: usize) -> Result<Self, QueueError> {
        Self::new(Some(capacity))
    }

    pub fn unbounded() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        Self::new(config.capacity)
    }

    /// Ties this queue to an external token, e.g. a child of an app-wide one.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self, state: &State<T>) -> bool {
        self.capacity.is_some_and(|cap| state.items.len() >= cap)
    }

    /// Appends `item` to the tail, suspending while the queue is at capacity.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        loop {
            // Register interest before checking state so a notify between the
            // check and the await is not lost.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if self.cancel.is_cancelled() {
                    return Err(QueueError::Cancelled);
                }
                if state.shutdown {
                    return Err(QueueError::Closed);
                }
                if !self.is_full(&state) {
                    state.items.push_back(WorkItem::Data(item));
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                trace!(queue_len = state.items.len(), "producer waiting for space");
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    pub async fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        tokio::time::timeout(timeout, self.enqueue(item))
            .await
            .map_err(|_| QueueError::timeout(timeout))?
    }

    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut state = self.lock();
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled.into());
        }
        if state.shutdown {
            return Err(QueueError::Closed.into());
        }
        if self.is_full(&state) {
            return Err(TryEnqueueError::Full(item));
        }
        state.items.push_back(WorkItem::Data(item));
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns the head item, suspending until one is available.
    ///
    /// Cancel-safe: an item is only removed on the path that returns it.
    pub async fn dequeue(&self) -> Result<WorkItem<T>, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue()? {
                return Ok(item);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    pub async fn dequeue_timeout(&self, timeout: Duration) -> Result<WorkItem<T>, QueueError> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .map_err(|_| QueueError::timeout(timeout))?
    }

    pub fn try_dequeue(&self) -> Result<Option<WorkItem<T>>, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        Ok(item)
    }

    /// Enqueues the end-of-stream marker. Only the first call succeeds.
    pub fn signal_shutdown(&self) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let mut state = self.lock();
        if state.shutdown {
            return Err(QueueError::ShutdownAlreadySignalled);
        }
        state.shutdown = true;
        state.items.push_back(WorkItem::EndOfStream);
        debug!(queue_len = state.items.len(), "end-of-stream signalled");
        drop(state);
        self.not_empty.notify_one();
        self.not_full.notify_waiters();
        Ok(())
    }

    pub fn requeue_end_of_stream(&self) {
        let mut state = self.lock();
        debug_assert!(state.shutdown, "marker requeued before shutdown was signalled");
        state.items.push_back(WorkItem::EndOfStream);
        drop(state);
        self.not_empty.notify_one();
    }

    pub fn cancel(&self) {
        debug!("async queue cancelled");
        self.cancel.cancel();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Default for AsyncWorkQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = AsyncWorkQueue::unbounded();
        for i in 0..5 {
            queue.enqueue(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue().await.unwrap(), WorkItem::Data(i));
        }
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_space() {
        let queue = Arc::new(AsyncWorkQueue::bounded(1).unwrap());
        queue.enqueue("Task 1").await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue("Task 2").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue().await.unwrap(), WorkItem::Data("Task 1"));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), WorkItem::Data("Task 2"));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(AsyncWorkQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::task::yield_now().await;
        queue.enqueue(42).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Ok(WorkItem::Data(42)));
    }

    #[tokio::test]
    async fn test_shutdown_is_single_shot() {
        let queue: AsyncWorkQueue<u8> = AsyncWorkQueue::unbounded();
        queue.signal_shutdown().unwrap();
        assert_eq!(
            queue.signal_shutdown(),
            Err(QueueError::ShutdownAlreadySignalled)
        );
        assert_eq!(queue.enqueue(1).await, Err(QueueError::Closed));
        assert!(queue.dequeue().await.unwrap().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_external_token_cancels_waiters() {
        let token = CancellationToken::new();
        let queue: Arc<AsyncWorkQueue<u8>> =
            Arc::new(AsyncWorkQueue::unbounded().with_cancellation_token(token.child_token()));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(consumer.await.unwrap(), Err(QueueError::Cancelled));
        assert!(queue.is_cancelled());
    }

    #[tokio::test]
    async fn test_dequeue_timeout() {
        let queue: AsyncWorkQueue<u8> = AsyncWorkQueue::unbounded();
        let result = queue.dequeue_timeout(Duration::from_millis(20)).await;
        assert_eq!(result, Err(QueueError::timeout(Duration::from_millis(20))));
        // A timed-out dequeue leaves the queue usable.
        queue.enqueue(1).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), WorkItem::Data(1));
    }

    #[tokio::test]
    async fn test_enqueue_timeout_when_full() {
        let queue = AsyncWorkQueue::bounded(1).unwrap();
        queue.enqueue(1).await.unwrap();
        assert!(matches!(
            queue.enqueue_timeout(2, Duration::from_millis(10)).await,
            Err(QueueError::Timeout { .. })
        ));
        assert_eq!(queue.try_enqueue(3), Err(TryEnqueueError::Full(3)));
    }
}
