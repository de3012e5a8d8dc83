//! Blocking work queue for OS threads.
//!
//! A `Mutex<VecDeque>` guarded by two condition variables: producers wait on
//! `not_full`, consumers wait on `not_empty`. Those two waits are the only
//! suspension points.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::error::{QueueError, TryEnqueueError};
use crate::item::WorkItem;

struct State<T> {
    items: VecDeque<WorkItem<T>>,
    shutdown: bool,
    cancelled: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T> WorkQueue<T> {
    /// Creates a queue holding at most `capacity` items; `None` is unbounded.
    pub fn new(capacity: Option<usize>) -> Result<Self, QueueError> {
        if capacity == Some(0) {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.unwrap_or(0)),
                shutdown: false,
                cancelled: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
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
                cancelled: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: None,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, QueueError> {
        Self::new(config.capacity)
    }

    // Queue state is only touched in short sections that cannot panic midway,
    // so a poisoned lock still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self, state: &State<T>) -> bool {
        self.capacity.is_some_and(|cap| state.items.len() >= cap)
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Appends `item` to the tail, blocking while the queue is at capacity.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        self.enqueue_until(item, None)
    }

    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.enqueue_until(item, Some((Instant::now() + timeout, timeout)))
    }

    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut state = self.lock();
        if state.cancelled {
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

    fn enqueue_until(
        &self,
        item: T,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Err(QueueError::Cancelled);
            }
            if state.shutdown {
                return Err(QueueError::Closed);
            }
            if !self.is_full(&state) {
                break;
            }
            trace!(queue_len = state.items.len(), "producer waiting for space");
            state = self.wait(&self.not_full, state, deadline)?;
        }
        state.items.push_back(WorkItem::Data(item));
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// Removes and returns the head item, blocking until one is available.
    pub fn dequeue(&self) -> Result<WorkItem<T>, QueueError> {
        self.dequeue_until(None)
    }

    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<WorkItem<T>, QueueError> {
        self.dequeue_until(Some((Instant::now() + timeout, timeout)))
    }

    /// Returns `Ok(None)` instead of blocking when the queue is empty.
    pub fn try_dequeue(&self) -> Result<Option<WorkItem<T>>, QueueError> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(QueueError::Cancelled);
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        Ok(item)
    }

    fn dequeue_until(
        &self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<WorkItem<T>, QueueError> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Err(QueueError::Cancelled);
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            state = self.wait(&self.not_empty, state, deadline)?;
        }
    }

    fn wait<'a>(
        &self,
        condvar: &Condvar,
        state: MutexGuard<'a, State<T>>,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<MutexGuard<'a, State<T>>, QueueError> {
        match deadline {
            None => Ok(condvar.wait(state).unwrap_or_else(PoisonError::into_inner)),
            Some((deadline, timeout)) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(QueueError::timeout(timeout));
                }
                let (state, _) = condvar
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(state)
            }
        }
    }

    // =========================================================================
    // Shutdown and cancellation
    // =========================================================================

    /// Enqueues the end-of-stream marker. Only the first call succeeds.
    ///
    /// The marker ignores the capacity bound, so this never blocks. Once it is
    /// queued, further `enqueue` calls fail with [`QueueError::Closed`].
    pub fn signal_shutdown(&self) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(QueueError::Cancelled);
        }
        if state.shutdown {
            return Err(QueueError::ShutdownAlreadySignalled);
        }
        state.shutdown = true;
        state.items.push_back(WorkItem::EndOfStream);
        debug!(queue_len = state.items.len(), "end-of-stream signalled");
        drop(state);
        self.not_empty.notify_one();
        // Producers parked on a full queue must now observe Closed.
        self.not_full.notify_all();
        Ok(())
    }

    /// Puts the end-of-stream marker back so the next consumer sees it too.
    pub fn requeue_end_of_stream(&self) {
        let mut state = self.lock();
        debug_assert!(state.shutdown, "marker requeued before shutdown was signalled");
        state.items.push_back(WorkItem::EndOfStream);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Wakes every blocked caller; all later operations return `Cancelled`.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        debug!(queue_len = state.items.len(), "queue cancelled");
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

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
        self.lock().cancelled
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::unbounded();
        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue().unwrap(), WorkItem::Data(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            WorkQueue::<u32>::bounded(0).err(),
            Some(QueueError::ZeroCapacity)
        );
    }

    #[test]
    fn test_enqueue_blocks_when_full() {
        let queue = Arc::new(WorkQueue::bounded(1).unwrap());
        queue.enqueue(1).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                queue.enqueue(2).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "producer should be blocked");

        assert_eq!(queue.dequeue().unwrap(), WorkItem::Data(1));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.dequeue().unwrap(), WorkItem::Data(2));
    }

    #[test]
    fn test_dequeue_blocks_until_item_arrives() {
        let queue = Arc::new(WorkQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue())
        };

        thread::sleep(Duration::from_millis(20));
        queue.enqueue("Task 1").unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(WorkItem::Data("Task 1")));
    }

    #[test]
    fn test_shutdown_marker_ignores_capacity() {
        let queue = WorkQueue::bounded(1).unwrap();
        queue.enqueue("last").unwrap();
        queue.signal_shutdown().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap(), WorkItem::Data("last"));
        assert_eq!(queue.dequeue().unwrap(), WorkItem::EndOfStream);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_closed() {
        let queue = WorkQueue::unbounded();
        queue.signal_shutdown().unwrap();
        assert_eq!(queue.enqueue(1), Err(QueueError::Closed));
        assert_eq!(
            queue.signal_shutdown(),
            Err(QueueError::ShutdownAlreadySignalled)
        );
        assert!(queue.is_shutdown());
    }

    #[test]
    fn test_blocked_producer_sees_closed_on_shutdown() {
        let queue = Arc::new(WorkQueue::bounded(1).unwrap());
        queue.enqueue(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(2))
        };
        thread::sleep(Duration::from_millis(20));
        queue.signal_shutdown().unwrap();
        assert_eq!(producer.join().unwrap(), Err(QueueError::Closed));
    }

    #[test]
    fn test_requeued_marker_reaches_next_consumer() {
        let queue: WorkQueue<u8> = WorkQueue::unbounded();
        queue.signal_shutdown().unwrap();

        assert!(queue.dequeue().unwrap().is_end_of_stream());
        queue.requeue_end_of_stream();
        assert!(queue.dequeue().unwrap().is_end_of_stream());
    }

    #[test]
    fn test_cancel_wakes_blocked_consumers() {
        let queue: Arc<WorkQueue<u8>> = Arc::new(WorkQueue::unbounded());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.cancel();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(QueueError::Cancelled));
        }
        assert_eq!(queue.enqueue(1), Err(QueueError::Cancelled));
    }

    #[test]
    fn test_dequeue_timeout_expires() {
        let queue: WorkQueue<u8> = WorkQueue::unbounded();
        let started = Instant::now();
        let result = queue.dequeue_timeout(Duration::from_millis(30));
        assert_eq!(result, Err(QueueError::timeout(Duration::from_millis(30))));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_enqueue_timeout_on_full_queue() {
        let queue = WorkQueue::bounded(1).unwrap();
        queue.enqueue(1).unwrap();
        assert!(matches!(
            queue.enqueue_timeout(2, Duration::from_millis(10)),
            Err(QueueError::Timeout { .. })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_try_operations() {
        let queue = WorkQueue::bounded(1).unwrap();
        assert_eq!(queue.try_dequeue(), Ok(None));
        queue.try_enqueue("a").unwrap();
        assert_eq!(queue.try_enqueue("b"), Err(TryEnqueueError::Full("b")));
        assert_eq!(queue.try_dequeue(), Ok(Some(WorkItem::Data("a"))));
    }
}
