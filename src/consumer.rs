//! Consumer role: dequeue, process, repeat until end-of-stream.
//!
//! Each consumer walks `Producing -> Draining -> Done`. Whoever dequeues the
//! end-of-stream marker puts it back before leaving, so one shutdown signal
//! reaches every consumer without a coordinator.

use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::async_queue::AsyncWorkQueue;
use crate::error::{ProcessError, QueueError};
use crate::item::WorkItem;
use crate::queue::WorkQueue;

// =============================================================================
// Processor
// =============================================================================

/// Handles one dequeued payload.
pub trait Processor<T>: Send + Sync {
    fn process(&self, consumer_id: usize, item: &T) -> Result<(), ProcessError>;
}

impl<T, F> Processor<T> for F
where
    F: Fn(usize, &T) -> Result<(), ProcessError> + Send + Sync,
{
    fn process(&self, consumer_id: usize, item: &T) -> Result<(), ProcessError> {
        self(consumer_id, item)
    }
}

/// Runs the processor, turning a panic into an ordinary failure.
///
/// A panic here would otherwise unwind past a consumer that may be about to
/// see the end-of-stream marker, and its siblings would never wake.
fn invoke<T, P>(processor: &P, consumer_id: usize, item: &T) -> Result<(), ProcessError>
where
    P: Processor<T> + ?Sized,
{
    panic::catch_unwind(AssertUnwindSafe(|| processor.process(consumer_id, item)))
        .unwrap_or_else(|payload| Err(ProcessError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerState {
    /// Started, nothing dequeued yet.
    Producing,
    /// Has processed at least one item and keeps looping.
    Draining,
    /// Observed end-of-stream. Terminal.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingFailure {
    /// Index into [`ConsumerReport::processed`].
    pub position: usize,
    pub error: ProcessError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerReport<T> {
    pub id: usize,
    /// Every payload this consumer dequeued, in dequeue order, including the
    /// ones whose processing failed.
    pub processed: Vec<T>,
    pub failures: Vec<ProcessingFailure>,
    pub state: ConsumerState,
}

impl<T> ConsumerReport<T> {
    fn new(id: usize) -> Self {
        Self {
            id,
            processed: Vec::new(),
            failures: Vec::new(),
            state: ConsumerState::Producing,
        }
    }

    fn record(&mut self, item: T, outcome: Result<(), ProcessError>) {
        if let Err(error) = outcome {
            warn!(consumer_id = self.id, %error, "processing failed");
            self.failures.push(ProcessingFailure {
                position: self.processed.len(),
                error,
            });
        }
        self.processed.push(item);
        self.state = ConsumerState::Draining;
    }

    fn finish(&mut self) {
        self.state = ConsumerState::Done;
        info!(
            consumer_id = self.id,
            processed = self.processed.len(),
            failed = self.failures.len(),
            "consumer observed end-of-stream"
        );
    }

    pub fn succeeded(&self) -> usize {
        self.processed.len() - self.failures.len()
    }
}

// =============================================================================
// Thread consumer
// =============================================================================

pub struct Consumer<T> {
    id: usize,
    queue: Arc<WorkQueue<T>>,
    processing_delay: Duration,
}

impl<T: Debug> Consumer<T> {
    pub fn new(id: usize, queue: Arc<WorkQueue<T>>) -> Self {
        Self {
            id,
            queue,
            processing_delay: Duration::ZERO,
        }
    }

    /// Sleeps this long after each item to simulate slow work.
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Loops until end-of-stream. Fails only if the queue is cancelled.
    pub fn run<P>(self, processor: &P) -> Result<ConsumerReport<T>, QueueError>
    where
        P: Processor<T> + ?Sized,
    {
        let mut report = ConsumerReport::new(self.id);
        debug!(consumer_id = self.id, "consumer started");

        loop {
            match self.queue.dequeue()? {
                WorkItem::Data(item) => {
                    info!(consumer_id = self.id, ?item, "processing");
                    let outcome = invoke(processor, self.id, &item);
                    if !self.processing_delay.is_zero() {
                        thread::sleep(self.processing_delay);
                    }
                    report.record(item, outcome);
                }
                WorkItem::EndOfStream => {
                    self.queue.requeue_end_of_stream();
                    report.finish();
                    return Ok(report);
                }
            }
        }
    }
}

// =============================================================================
// Async consumer
// =============================================================================

pub struct AsyncConsumer<T> {
    id: usize,
    queue: Arc<AsyncWorkQueue<T>>,
    processing_delay: Duration,
}

impl<T: Debug> AsyncConsumer<T> {
    pub fn new(id: usize, queue: Arc<AsyncWorkQueue<T>>) -> Self {
        Self {
            id,
            queue,
            processing_delay: Duration::ZERO,
        }
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub async fn run<P>(self, processor: &P) -> Result<ConsumerReport<T>, QueueError>
    where
        P: Processor<T> + ?Sized,
    {
        let mut report = ConsumerReport::new(self.id);
        debug!(consumer_id = self.id, "async consumer started");

        loop {
            match self.queue.dequeue().await? {
                WorkItem::Data(item) => {
                    info!(consumer_id = self.id, ?item, "processing");
                    let outcome = invoke(processor, self.id, &item);
                    if !self.processing_delay.is_zero() {
                        tokio::time::sleep(self.processing_delay).await;
                    }
                    report.record(item, outcome);
                }
                WorkItem::EndOfStream => {
                    self.queue.requeue_end_of_stream();
                    report.finish();
                    return Ok(report);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_: usize, _: &&str) -> Result<(), ProcessError> {
        Ok(())
    }

    #[test]
    fn test_consumer_drains_then_requeues_marker() {
        let queue = Arc::new(WorkQueue::unbounded());
        queue.enqueue("Task 1").unwrap();
        queue.enqueue("Task 2").unwrap();
        queue.signal_shutdown().unwrap();

        let report = Consumer::new(1, Arc::clone(&queue)).run(&accept_all).unwrap();

        assert_eq!(report.processed, vec!["Task 1", "Task 2"]);
        assert_eq!(report.state, ConsumerState::Done);
        // The marker is back for the next consumer.
        assert_eq!(queue.dequeue().unwrap(), WorkItem::EndOfStream);
    }

    #[test]
    fn test_idle_consumer_stays_in_producing_until_done() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::unbounded());
        queue.signal_shutdown().unwrap();

        let report = Consumer::new(7, queue).run(&accept_all).unwrap();
        assert!(report.processed.is_empty());
        assert_eq!(report.state, ConsumerState::Done);
    }

    #[test]
    fn test_failed_item_is_not_redelivered() {
        let queue = Arc::new(WorkQueue::unbounded());
        for label in ["ok", "bad", "ok again"] {
            queue.enqueue(label).unwrap();
        }
        queue.signal_shutdown().unwrap();

        let processor = |_: usize, item: &&str| {
            if *item == "bad" {
                Err(ProcessError::failed("rejected"))
            } else {
                Ok(())
            }
        };
        let report = Consumer::new(1, queue).run(&processor).unwrap();

        assert_eq!(report.processed, vec!["ok", "bad", "ok again"]);
        assert_eq!(
            report.failures,
            vec![ProcessingFailure {
                position: 1,
                error: ProcessError::failed("rejected"),
            }]
        );
        assert_eq!(report.succeeded(), 2);
    }

    #[test]
    fn test_processor_panic_is_recorded() {
        let queue = Arc::new(WorkQueue::unbounded());
        queue.enqueue(0u32).unwrap();
        queue.signal_shutdown().unwrap();

        let processor = |_: usize, _: &u32| -> Result<(), ProcessError> { panic!("boom") };
        let report = Consumer::new(1, Arc::clone(&queue)).run(&processor).unwrap();

        assert_eq!(
            report.failures[0].error,
            ProcessError::Panicked("boom".to_string())
        );
        assert_eq!(report.state, ConsumerState::Done);
        assert!(queue.dequeue().unwrap().is_end_of_stream());
    }

    #[test]
    fn test_cancelled_queue_surfaces_error() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::unbounded());
        queue.cancel();
        assert_eq!(
            Consumer::new(1, queue).run(&accept_all),
            Err(QueueError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_async_consumer_drains() {
        let queue = Arc::new(AsyncWorkQueue::unbounded());
        queue.enqueue("Task 1").await.unwrap();
        queue.signal_shutdown().unwrap();

        let report = AsyncConsumer::new(2, Arc::clone(&queue))
            .run(&accept_all)
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["Task 1"]);
        assert_eq!(report.state, ConsumerState::Done);
        assert!(queue.try_dequeue().unwrap().unwrap().is_end_of_stream());
    }
}
