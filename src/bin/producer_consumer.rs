//! Producer/consumer demo over the work queue.
//!
//! Run with: cargo run --bin producer_consumer -- [CONFIG.toml] [--async] [--json]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tracing_subscriber::EnvFilter;
use workqueue::{
    AppConfig, AsyncWorkQueue, AsyncWorkerPool, PoolConfig, PoolReport, ProcessError, WorkQueue,
    WorkerPool,
};

struct Args {
    config: Option<PathBuf>,
    use_async: bool,
    json: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        use_async: false,
        json: false,
    };
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--async" => args.use_async = true,
            "--json" => args.json = true,
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            path => {
                if args.config.replace(PathBuf::from(path)).is_some() {
                    bail!("only one config file may be given");
                }
            }
        }
    }
    Ok(args)
}

/// Two consumers, half a second per produced item, a second per processed one.
fn reference_config() -> AppConfig {
    AppConfig {
        pool: PoolConfig {
            consumers: Some(2),
            production_delay_ms: 500,
            processing_delay_ms: 1000,
        },
        ..AppConfig::default()
    }
}

fn tasks() -> Vec<String> {
    (1..=5).map(|i| format!("Task {i}")).collect()
}

fn print_task(consumer_id: usize, task: &String) -> Result<(), ProcessError> {
    println!("Consumer {} processing: {}", consumer_id, task.cyan());
    Ok(())
}

fn run_threads(config: &AppConfig) -> Result<PoolReport<String>> {
    let queue = Arc::new(WorkQueue::from_config(&config.queue)?);
    let pool = WorkerPool::from_config(&config.pool)?;
    Ok(pool.run_with_producer(queue, tasks(), Arc::new(print_task))?)
}

fn run_async(config: &AppConfig) -> Result<PoolReport<String>> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let queue = Arc::new(AsyncWorkQueue::from_config(&config.queue)?);
        let pool = AsyncWorkerPool::from_config(&config.pool)?;
        let report = pool
            .run_with_producer(queue, tasks(), Arc::new(print_task))
            .await?;
        Ok::<_, anyhow::Error>(report)
    })
}

fn print_summary(report: &PoolReport<String>) {
    println!("\n{}", "=== Summary ===".bold());
    for consumer in &report.consumers {
        println!(
            "Consumer {}: {} processed, {} failed ({:?})",
            consumer.id,
            consumer.processed.len().to_string().green(),
            consumer.failures.len().to_string().red(),
            consumer.state,
        );
    }
    println!(
        "{} tasks processed by {} consumers",
        report.processed_count(),
        report.consumer_count()
    );
}

fn main() -> Result<()> {
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => reference_config(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mode = if args.use_async { "async tasks" } else { "threads" };
    println!("{}", format!("=== Producer-Consumer Pattern ({mode}) ===").bold());

    let report = if args.use_async {
        run_async(&config)?
    } else {
        run_threads(&config)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}
