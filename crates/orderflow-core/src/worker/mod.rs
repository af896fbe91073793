//! The delivery worker: polls for eligible tasks, claims a batch, dispatches
//! each claimed task through the selected egress node with bounded
//! concurrency, and finalizes the outcome.
//!
//! Mirrors the teacher's dispatch-loop shape (bounded concurrency via a
//! semaphore, cooperative shutdown via a `CancellationToken`) but drives
//! order-task delivery instead of agent orchestration.

pub mod backoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use orderflow_db::models::{OrderTask, TaskStatus};
use orderflow_db::queries::{orders as order_db, tasks as task_db};

use crate::dispatch::{DispatchClient, DispatchOutcome, DispatchRequest};
use crate::registry;
use crate::selector::{self, SelectionRequest};
use crate::state::TaskStateMachine;

/// Tunables for one worker's poll/claim/dispatch loop.
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// Identity this worker claims tasks under.
    pub worker_id: String,
    /// Max tasks claimed per poll (B).
    pub batch_size: i64,
    /// Max tasks dispatched concurrently (C).
    pub concurrency: usize,
    /// Time between polls when there is no work.
    pub poll_interval: Duration,
    /// A task whose `execution_started_at` is older than this is
    /// considered orphaned and reclaimed to `Pending`.
    pub orphan_threshold: Duration,
    /// Ceiling applied to the exponential backoff schedule.
    pub backoff_ceiling: Duration,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size: 10,
            concurrency: 5,
            poll_interval: Duration::from_secs(2),
            orphan_threshold: Duration::from_secs(30),
            backoff_ceiling: Duration::from_secs(3600),
        }
    }
}

/// Running counters for observability, safe to read concurrently with
/// the worker loop.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub claimed: AtomicU64,
    pub completed: AtomicU64,
    pub retried: AtomicU64,
    pub failed_permanent: AtomicU64,
    pub orphans_reclaimed: AtomicU64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_permanent: self.failed_permanent.load(Ordering::Relaxed),
            orphans_reclaimed: self.orphans_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`WorkerMetrics`] suitable for serialization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerMetricsSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed_permanent: u64,
    pub orphans_reclaimed: u64,
}

/// Drives one worker's claim/dispatch/finalize cycle against a pool of
/// order tasks.
pub struct DeliveryWorker {
    pool: PgPool,
    dispatch: Arc<dyn DispatchClient>,
    config: DeliveryWorkerConfig,
    metrics: Arc<WorkerMetrics>,
}

impl DeliveryWorker {
    pub fn new(pool: PgPool, dispatch: Arc<dyn DispatchClient>, config: DeliveryWorkerConfig) -> Self {
        Self {
            pool,
            dispatch,
            config,
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `cancel` fires, then drain in-flight dispatches and
    /// return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "delivery worker starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(claimed) if claimed > 0 => continue,
                Ok(_) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    error!(worker_id = %self.config.worker_id, error = %err, "tick failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "delivery worker stopped");
        Ok(())
    }

    /// One poll cycle: reclaim orphans, claim a batch, dispatch it with
    /// bounded concurrency. Returns the number of tasks claimed.
    pub async fn tick(&self) -> Result<usize> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.orphan_threshold)
                .unwrap_or(chrono::Duration::seconds(30));
        let orphans = task_db::reclaim_orphaned(&self.pool, threshold)
            .await
            .context("failed to reclaim orphaned tasks")?;
        if !orphans.is_empty() {
            self.metrics
                .orphans_reclaimed
                .fetch_add(orphans.len() as u64, Ordering::Relaxed);
            warn!(count = orphans.len(), "reclaimed orphaned tasks");
        }

        let claimed = task_db::claim_batch(&self.pool, &self.config.worker_id, self.config.batch_size)
            .await
            .context("failed to claim task batch")?;

        if claimed.is_empty() {
            return Ok(0);
        }

        self.metrics
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(claimed.len());

        let claimed_count = claimed.len();
        for task in claimed {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let pool = self.pool.clone();
            let dispatch = Arc::clone(&self.dispatch);
            let worker_id = self.config.worker_id.clone();
            let backoff_ceiling = self.config.backoff_ceiling;
            let metrics = Arc::clone(&self.metrics);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) =
                    process_task(&pool, dispatch.as_ref(), &worker_id, task, backoff_ceiling, &metrics)
                        .await
                {
                    error!(error = %err, "task processing failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(claimed_count)
    }
}

/// Dispatch one claimed task and finalize its outcome.
async fn process_task(
    pool: &PgPool,
    dispatch: &dyn DispatchClient,
    worker_id: &str,
    mut task: OrderTask,
    backoff_ceiling: Duration,
    metrics: &WorkerMetrics,
) -> Result<()> {
    let order = order_db::get_order(pool, task.order_id)
        .await?
        .with_context(|| format!("order {} for task {} not found", task.order_id, task.id))?;

    let nodes = registry::list_selectable(pool, None, order.region.as_deref()).await?;
    let selection = SelectionRequest {
        task_id: task.id,
        min_tier: None,
        region: order.region.clone(),
    };
    let node = match selector::select_node(&nodes, &selection) {
        Ok(node) => node,
        Err(_) => {
            // No egress capacity right now; treat as a transient failure
            // so it retries on the normal backoff schedule rather than
            // spinning.
            return retry_task(pool, worker_id, &task, "no selectable proxy node", backoff_ceiling, metrics)
                .await;
        }
    };
    let node_id = node.id;

    registry::claim_capacity(pool, node_id).await?;
    let outcome = dispatch
        .dispatch(
            &DispatchRequest {
                task_id: task.id,
                order_id: task.order_id,
                service_id: order.service_id.clone(),
                target_reference: order.target_reference.clone(),
                quantity: task.quantity,
                idempotency_token: task.idempotency_token.clone(),
            },
            node,
        )
        .await;
    registry::release_capacity(pool, node_id).await?;

    match outcome {
        Ok(DispatchOutcome::Delivered { plays_delivered }) => {
            let delivered = plays_delivered.clamp(0, task.quantity);
            registry::report_outcome(pool, node_id, true, false, 0).await?;

            if delivered == task.quantity {
                TaskStateMachine::complete(pool, task.id, worker_id, Some(node_id)).await?;
                order_db::apply_delivery(pool, task.order_id, task.quantity).await?;
                metrics.completed.fetch_add(1, Ordering::Relaxed);
            } else if delivered > 0 {
                // Success with partial delivery: credit what landed, then
                // treat the shortfall as a transient failure against the
                // same task so it is retried for the remainder.
                order_db::apply_delivery(pool, task.order_id, delivered).await?;
                task_db::reduce_quantity(pool, task.id, delivered).await?;
                task.quantity -= delivered;
                retry_task(
                    pool,
                    worker_id,
                    &task,
                    "partial delivery, remainder retried",
                    backoff_ceiling,
                    metrics,
                )
                .await?;
            } else {
                retry_task(pool, worker_id, &task, "zero plays delivered", backoff_ceiling, metrics).await?;
            }
        }
        Ok(DispatchOutcome::Transient { reason }) => {
            registry::report_outcome(pool, node_id, false, false, 0).await?;
            retry_task(pool, worker_id, &task, &reason, backoff_ceiling, metrics).await?;
        }
        Ok(DispatchOutcome::Banned { reason }) => {
            registry::report_outcome(pool, node_id, false, true, 0).await?;
            retry_task(pool, worker_id, &task, &reason, backoff_ceiling, metrics).await?;
        }
        Ok(DispatchOutcome::Permanent { reason }) => {
            TaskStateMachine::fail_permanently(pool, task.id, worker_id, &reason).await?;
            order_db::apply_permanent_failure(pool, task.order_id, task.quantity).await?;
            metrics.failed_permanent.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            retry_task(pool, worker_id, &task, &err.to_string(), backoff_ceiling, metrics).await?;
        }
    }

    if task_db::is_order_complete(pool, task.order_id).await? {
        order_db::finalize(pool, task.order_id).await?;
    }

    Ok(())
}

async fn retry_task(
    pool: &PgPool,
    worker_id: &str,
    task: &OrderTask,
    reason: &str,
    backoff_ceiling: Duration,
    metrics: &WorkerMetrics,
) -> Result<()> {
    let next_attempt = task.attempts + 1;
    if next_attempt >= task.max_attempts {
        TaskStateMachine::fail_permanently(pool, task.id, worker_id, reason).await?;
        order_db::apply_permanent_failure(pool, task.order_id, task.quantity).await?;
        metrics.failed_permanent.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let delay = backoff::backoff_for_attempt(next_attempt, backoff_ceiling);
    let retry_after = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(30));
    let token = crate::idempotency::token(task.order_id, task.sequence, next_attempt);

    TaskStateMachine::retry(pool, task.id, worker_id, reason, retry_after, &token).await?;
    metrics.retried.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// A task status is considered stale for orphan detection when it has
/// stayed `Executing` without a matching finalize call.
pub fn is_reclaimable(status: TaskStatus) -> bool {
    status == TaskStatus::Executing
}
