//! `orderflow worker run`: run a delivery worker until interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use orderflow_core::dispatch::{DispatchOutcome, SimulatedDispatchClient};
use orderflow_core::worker::{DeliveryWorker, DeliveryWorkerConfig};

/// Run a delivery worker until Ctrl+C, printing a metrics line on exit.
///
/// There is no live fulfillment integration wired in yet, so the worker
/// runs against a [`SimulatedDispatchClient`] that always reports
/// delivered. Swap in a real `DispatchClient` implementation once one
/// exists.
pub async fn run_worker(
    pool: &PgPool,
    worker_id: Option<String>,
    batch_size: i64,
    concurrency: usize,
) -> Result<()> {
    let mut config = DeliveryWorkerConfig::default();
    if let Some(id) = worker_id {
        config.worker_id = id;
    }
    config.batch_size = batch_size;
    config.concurrency = concurrency;

    println!("Starting delivery worker {}", config.worker_id);
    println!("  batch_size:  {}", config.batch_size);
    println!("  concurrency: {}", config.concurrency);

    // `plays_delivered` is clamped to each task's own quantity by the
    // worker, so a large sentinel here means "deliver everything asked".
    let dispatch = Arc::new(SimulatedDispatchClient::always(DispatchOutcome::Delivered {
        plays_delivered: i32::MAX,
    }));
    let worker = DeliveryWorker::new(pool.clone(), dispatch, config);
    let metrics = worker.metrics();

    // Graceful shutdown: first Ctrl+C cancels and drains, second forces
    // an immediate exit.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    worker.run(cancel).await?;

    let snapshot = metrics.snapshot();
    println!("Worker stopped. Final counters:");
    println!("  claimed:           {}", snapshot.claimed);
    println!("  completed:         {}", snapshot.completed);
    println!("  retried:           {}", snapshot.retried);
    println!("  failed_permanent:  {}", snapshot.failed_permanent);
    println!("  orphans_reclaimed: {}", snapshot.orphans_reclaimed);

    Ok(())
}
