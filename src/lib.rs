//! Bounded producer/consumer work queue with in-band shutdown.
//!
//! One producer enqueues [`WorkItem::Data`] payloads and finishes with a
//! single [`WorkItem::EndOfStream`]. Any number of consumers drain the queue;
//! the one that dequeues the marker puts it back, so every consumer sees
//! shutdown exactly once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use workqueue::{ProcessError, WorkQueue, WorkerPool};
//!
//! let queue = Arc::new(WorkQueue::unbounded());
//! let report = WorkerPool::new(2)?
//!     .run_with_producer(
//!         queue,
//!         ["Task 1", "Task 2", "Task 3"],
//!         Arc::new(|id: usize, task: &&str| -> Result<(), ProcessError> {
//!             println!("Consumer {id} processing: {task}");
//!             Ok(())
//!         }),
//!     )?;
//! assert_eq!(report.processed_count(), 3);
//! # Ok::<(), workqueue::PoolError>(())
//! ```

pub mod async_queue;
pub mod config;
pub mod consumer;
pub mod error;
pub mod item;
pub mod pool;
pub mod producer;
pub mod queue;

pub use async_queue::AsyncWorkQueue;
pub use config::{AppConfig, LoggingConfig, PoolConfig, QueueConfig};
pub use consumer::{AsyncConsumer, Consumer, ConsumerReport, ConsumerState, ProcessingFailure, Processor};
pub use error::{ConfigError, PoolError, ProcessError, QueueError, TryEnqueueError};
pub use item::WorkItem;
pub use pool::{AsyncWorkerPool, PoolReport, RunningPool, WorkerPool};
pub use producer::{AsyncProducer, Producer};
pub use queue::WorkQueue;
