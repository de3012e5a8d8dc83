//! Caller-controlled executors that run a fixed number of consumers.
//!
//! [`WorkerPool`] spawns named OS threads, [`AsyncWorkerPool`] spawns tokio
//! tasks. Both collect one [`ConsumerReport`] per consumer in the order the
//! consumers finished.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::async_queue::AsyncWorkQueue;
use crate::config::PoolConfig;
use crate::consumer::{AsyncConsumer, Consumer, ConsumerReport, Processor};
use crate::error::{PoolError, QueueError};
use crate::producer::{AsyncProducer, Producer};
use crate::queue::WorkQueue;

// =============================================================================
// Pool report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport<T> {
    /// In completion order.
    pub consumers: Vec<ConsumerReport<T>>,
}

impl<T> PoolReport<T> {
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Every payload handed to a processor, across all consumers.
    pub fn processed(&self) -> impl Iterator<Item = &T> + '_ {
        self.consumers.iter().flat_map(|report| report.processed.iter())
    }

    pub fn processed_count(&self) -> usize {
        self.consumers.iter().map(|report| report.processed.len()).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.consumers.iter().map(|report| report.failures.len()).sum()
    }

    pub fn consumer(&self, id: usize) -> Option<&ConsumerReport<T>> {
        self.consumers.iter().find(|report| report.id == id)
    }
}

// =============================================================================
// Thread pool
// =============================================================================

type Outcome<T> = (usize, Result<ConsumerReport<T>, QueueError>);

#[derive(Debug, Clone)]
pub struct WorkerPool {
    consumers: usize,
    production_delay: Duration,
    processing_delay: Duration,
}

impl WorkerPool {
    pub fn new(consumers: usize) -> Result<Self, PoolError> {
        if consumers == 0 {
            return Err(PoolError::NoConsumers);
        }
        Ok(Self {
            consumers,
            production_delay: Duration::ZERO,
            processing_delay: Duration::ZERO,
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Ok(Self::new(config.consumer_count())?
            .with_production_delay(config.production_delay())
            .with_processing_delay(config.processing_delay()))
    }

    pub fn with_production_delay(mut self, delay: Duration) -> Self {
        self.production_delay = delay;
        self
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Starts the consumers and returns without waiting for them.
    pub fn spawn<T, P>(
        &self,
        queue: Arc<WorkQueue<T>>,
        processor: Arc<P>,
    ) -> Result<RunningPool<T>, PoolError>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
    {
        let (report_tx, report_rx) = channel::unbounded::<Outcome<T>>();
        let mut handles = Vec::with_capacity(self.consumers);

        for id in 1..=self.consumers {
            let consumer = Consumer::new(id, Arc::clone(&queue))
                .with_processing_delay(self.processing_delay);
            let processor = Arc::clone(&processor);
            let report_tx = report_tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("consumer-{id}"))
                .spawn(move || {
                    let outcome = consumer.run(processor.as_ref());
                    // The receiver only goes away if the pool handle was dropped.
                    let _ = report_tx.send((id, outcome));
                });

            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(source) => {
                    error!(consumer_id = id, %source, "failed to spawn consumer");
                    // Release the consumers that did start.
                    queue.cancel();
                    for (_, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn { id, source });
                }
            }
        }

        debug!(consumers = self.consumers, "consumer threads started");
        Ok(RunningPool {
            handles,
            reports: report_rx,
        })
    }

    /// Runs consumers against an already-fed queue until they all finish.
    pub fn run<T, P>(&self, queue: Arc<WorkQueue<T>>, processor: Arc<P>) -> Result<PoolReport<T>, PoolError>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
    {
        self.spawn(queue, processor)?.join()
    }

    /// Starts the consumers, produces `items` on the calling thread, then
    /// waits for every consumer to observe end-of-stream.
    pub fn run_with_producer<T, P, I>(
        &self,
        queue: Arc<WorkQueue<T>>,
        items: I,
        processor: Arc<P>,
    ) -> Result<PoolReport<T>, PoolError>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
        I: IntoIterator<Item = T>,
    {
        let running = self.spawn(Arc::clone(&queue), processor)?;

        let produced = Producer::new(Arc::clone(&queue))
            .with_delay(self.production_delay)
            .run(items);

        match produced {
            Ok(count) => {
                info!(produced = count, "waiting for consumers to drain");
                running.join()
            }
            Err(err) => {
                error!(%err, "producer failed, cancelling consumers");
                queue.cancel();
                // Consumer outcomes are all Cancelled now; report the root cause.
                let _ = running.join();
                Err(err.into())
            }
        }
    }
}

/// Handle to consumers started by [`WorkerPool::spawn`].
pub struct RunningPool<T> {
    handles: Vec<(usize, JoinHandle<()>)>,
    reports: Receiver<Outcome<T>>,
}

impl<T> RunningPool<T> {
    pub fn join(self) -> Result<PoolReport<T>, PoolError> {
        let RunningPool { handles, reports } = self;

        let mut lost = None;
        for (id, handle) in handles {
            if handle.join().is_err() {
                error!(consumer_id = id, "consumer thread panicked");
                lost.get_or_insert(id);
            }
        }
        if let Some(id) = lost {
            return Err(PoolError::ConsumerLost { id });
        }

        let mut consumers = Vec::new();
        // Every sender lived in a consumer thread, so the channel is closed now.
        for (_, outcome) in reports.iter() {
            consumers.push(outcome?);
        }
        Ok(PoolReport { consumers })
    }
}

// =============================================================================
// Async pool
// =============================================================================

type TaskOutcome<T> = (usize, Result<Result<ConsumerReport<T>, QueueError>, JoinError>);

#[derive(Debug, Clone)]
pub struct AsyncWorkerPool {
    consumers: usize,
    production_delay: Duration,
    processing_delay: Duration,
}

impl AsyncWorkerPool {
    pub fn new(consumers: usize) -> Result<Self, PoolError> {
        if consumers == 0 {
            return Err(PoolError::NoConsumers);
        }
        Ok(Self {
            consumers,
            production_delay: Duration::ZERO,
            processing_delay: Duration::ZERO,
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Ok(Self::new(config.consumer_count())?
            .with_production_delay(config.production_delay())
            .with_processing_delay(config.processing_delay()))
    }

    pub fn with_production_delay(mut self, delay: Duration) -> Self {
        self.production_delay = delay;
        self
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    fn spawn<T, P>(
        &self,
        queue: &Arc<AsyncWorkQueue<T>>,
        processor: &Arc<P>,
    ) -> FuturesUnordered<impl Future<Output = TaskOutcome<T>>>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
    {
        let tasks = FuturesUnordered::new();
        for id in 1..=self.consumers {
            let consumer = AsyncConsumer::new(id, Arc::clone(queue))
                .with_processing_delay(self.processing_delay);
            let processor = Arc::clone(processor);
            let handle = tokio::spawn(async move { consumer.run(processor.as_ref()).await });
            tasks.push(async move { (id, handle.await) });
        }
        debug!(consumers = self.consumers, "consumer tasks started");
        tasks
    }

    pub async fn run<T, P>(
        &self,
        queue: Arc<AsyncWorkQueue<T>>,
        processor: Arc<P>,
    ) -> Result<PoolReport<T>, PoolError>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
    {
        let tasks = self.spawn(&queue, &processor);
        collect(tasks).await
    }

    pub async fn run_with_producer<T, P, I>(
        &self,
        queue: Arc<AsyncWorkQueue<T>>,
        items: I,
        processor: Arc<P>,
    ) -> Result<PoolReport<T>, PoolError>
    where
        T: Debug + Send + 'static,
        P: Processor<T> + 'static,
        I: IntoIterator<Item = T>,
    {
        let tasks = self.spawn(&queue, &processor);

        let produced = AsyncProducer::new(Arc::clone(&queue))
            .with_delay(self.production_delay)
            .run(items)
            .await;

        match produced {
            Ok(count) => {
                info!(produced = count, "waiting for consumers to drain");
                collect(tasks).await
            }
            Err(err) => {
                error!(%err, "producer failed, cancelling consumers");
                queue.cancel();
                let _ = collect(tasks).await;
                Err(err.into())
            }
        }
    }
}

async fn collect<T, F>(mut tasks: FuturesUnordered<F>) -> Result<PoolReport<T>, PoolError>
where
    F: Future<Output = TaskOutcome<T>>,
{
    let mut consumers = Vec::new();
    let mut first_error = None;

    while let Some((id, joined)) = tasks.next().await {
        match joined {
            Ok(Ok(report)) => consumers.push(report),
            Ok(Err(err)) => {
                first_error.get_or_insert(PoolError::Queue(err));
            }
            Err(join_error) => {
                error!(consumer_id = id, %join_error, "consumer task failed");
                first_error.get_or_insert(PoolError::ConsumerLost { id });
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(PoolReport { consumers }),
    }
}
