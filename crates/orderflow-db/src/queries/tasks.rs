//! Database query functions for the `order_tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::OrderTask;
#[cfg(test)]
use crate::models::TaskStatus;

/// One row to be inserted as part of a batch split for an order.
pub struct NewTask {
    pub order_id: Uuid,
    pub sequence: i32,
    pub quantity: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub idempotency_token: String,
}

/// Insert every task of a batch split in a single transaction.
///
/// `(order_id, sequence)` and `idempotency_token` are both unique, so a
/// retried split is rejected rather than silently duplicated.
pub async fn insert_batch(pool: &PgPool, tasks: &[NewTask]) -> Result<Vec<OrderTask>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut inserted = Vec::with_capacity(tasks.len());

    for task in tasks {
        let row = sqlx::query_as::<_, OrderTask>(
            "INSERT INTO order_tasks \
                (order_id, sequence, quantity, status, attempts, max_attempts, \
                 scheduled_at, idempotency_token) \
             VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6) \
             RETURNING *",
        )
        .bind(task.order_id)
        .bind(task.sequence)
        .bind(task.quantity)
        .bind(task.max_attempts)
        .bind(task.scheduled_at)
        .bind(&task.idempotency_token)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert order task")?;
        inserted.push(row);
    }

    tx.commit().await.context("failed to commit task batch")?;
    Ok(inserted)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<OrderTask>> {
    let task = sqlx::query_as::<_, OrderTask>("SELECT * FROM order_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given order, ordered by sequence.
pub async fn list_tasks_for_order(pool: &PgPool, order_id: Uuid) -> Result<Vec<OrderTask>> {
    let tasks = sqlx::query_as::<_, OrderTask>(
        "SELECT * FROM order_tasks WHERE order_id = $1 ORDER BY sequence ASC",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for order")?;

    Ok(tasks)
}

/// Claim up to `limit` eligible tasks for `worker_id`.
///
/// Eligible means `Pending` with `scheduled_at <= now()`, or
/// `FailedRetrying` with `retry_after <= now()`. The claim is an atomic
/// conditional UPDATE keyed on the row's current status so two workers
/// racing on the same batch never both win.
pub async fn claim_batch(pool: &PgPool, worker_id: &str, limit: i64) -> Result<Vec<OrderTask>> {
    let claimed = sqlx::query_as::<_, OrderTask>(
        "UPDATE order_tasks \
         SET status = 'executing', \
             worker_id = $1, \
             execution_started_at = NOW() \
         WHERE id IN ( \
             SELECT id FROM order_tasks \
             WHERE (status = 'pending' AND scheduled_at <= NOW()) \
                OR (status = 'failed_retrying' AND retry_after <= NOW()) \
             ORDER BY scheduled_at ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to claim task batch")?;

    Ok(claimed)
}

/// Atomically finalize a claimed task as `Completed`.
///
/// Optimistic-locked on `status = 'executing' AND worker_id = $worker_id`
/// so a finalize from a worker that has since been declared orphaned is
/// rejected rather than clobbering a reclaim.
pub async fn finalize_completed(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    proxy_node_id: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE order_tasks \
         SET status = 'completed', \
             executed_at = NOW(), \
             proxy_node_id = COALESCE($3, proxy_node_id) \
         WHERE id = $1 AND status = 'executing' AND worker_id = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(proxy_node_id)
    .execute(pool)
    .await
    .context("failed to finalize completed task")?;

    Ok(result.rows_affected())
}

/// Atomically finalize a claimed task as a transient failure, scheduling a
/// retry and refreshing its idempotency token.
///
/// `retry_after` must be computed by the caller per the exponential
/// backoff schedule.
pub async fn finalize_retry(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    error: &str,
    retry_after: DateTime<Utc>,
    new_idempotency_token: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE order_tasks \
         SET status = 'failed_retrying', \
             attempts = attempts + 1, \
             last_error = $3, \
             retry_after = $4, \
             idempotency_token = $5, \
             worker_id = NULL, \
             execution_started_at = NULL \
         WHERE id = $1 AND status = 'executing' AND worker_id = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(error)
    .bind(retry_after)
    .bind(new_idempotency_token)
    .execute(pool)
    .await
    .context("failed to finalize task as retryable")?;

    Ok(result.rows_affected())
}

/// Atomically finalize a claimed task as a permanent failure (attempts
/// exhausted).
pub async fn finalize_permanent_failure(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE order_tasks \
         SET status = 'failed_permanent', \
             attempts = attempts + 1, \
             last_error = $3, \
             executed_at = NOW() \
         WHERE id = $1 AND status = 'executing' AND worker_id = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to finalize task as permanently failed")?;

    Ok(result.rows_affected())
}

/// Atomically reduce a task's quantity after a partial delivery credits
/// part of it to the order's `delivered` counter. The remainder becomes
/// what the task's next attempt still owes. Guarded so quantity never
/// drops below 1 (a task always owes at least one unit until it reaches
/// a terminal status).
pub async fn reduce_quantity(pool: &PgPool, task_id: Uuid, delivered: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE order_tasks SET quantity = quantity - $2 \
         WHERE id = $1 AND quantity - $2 >= 1",
    )
    .bind(task_id)
    .bind(delivered)
    .execute(pool)
    .await
    .context("failed to reduce task quantity after partial delivery")?;

    Ok(result.rows_affected())
}

/// Reclaim tasks whose worker has gone silent: `Executing` with
/// `execution_started_at` older than `threshold`, returned to `Pending`
/// without incrementing `attempts` or touching `idempotency_token`.
///
/// This is distinct from a retry transition: an orphan sweep is a
/// liveness recovery, not a delivery failure, so it must not consume
/// retry budget.
pub async fn reclaim_orphaned(pool: &PgPool, threshold: DateTime<Utc>) -> Result<Vec<OrderTask>> {
    let tasks = sqlx::query_as::<_, OrderTask>(
        "UPDATE order_tasks \
         SET status = 'pending', \
             worker_id = NULL, \
             execution_started_at = NULL \
         WHERE status = 'executing' AND execution_started_at < $1 \
         RETURNING *",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await
    .context("failed to reclaim orphaned tasks")?;

    Ok(tasks)
}

/// Status counts for an order's tasks.
#[derive(Debug, Clone, Default)]
pub struct OrderProgress {
    pub pending: i64,
    pub executing: i64,
    pub completed: i64,
    pub failed_retrying: i64,
    pub failed_permanent: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given order.
pub async fn get_order_progress(pool: &PgPool, order_id: Uuid) -> Result<OrderProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM order_tasks \
         WHERE order_id = $1 \
         GROUP BY status",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("failed to get order progress")?;

    let mut progress = OrderProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "executing" => progress.executing = *count,
            "completed" => progress.completed = *count,
            "failed_retrying" => progress.failed_retrying = *count,
            "failed_permanent" => progress.failed_permanent = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Check whether every task of an order has reached a terminal status.
pub async fn is_order_complete(pool: &PgPool, order_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM order_tasks \
         WHERE order_id = $1 AND status NOT IN ('completed', 'failed_permanent')",
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
    .context("failed to check order completion")?;

    Ok(row.0 == 0)
}

/// List every task in `FailedPermanent` status for an order (dead-letter
/// view).
pub async fn list_permanently_failed(pool: &PgPool, order_id: Uuid) -> Result<Vec<OrderTask>> {
    let tasks = sqlx::query_as::<_, OrderTask>(
        "SELECT * FROM order_tasks \
         WHERE order_id = $1 AND status = 'failed_permanent' \
         ORDER BY sequence ASC",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("failed to list permanently failed tasks")?;

    Ok(tasks)
}

/// List every permanently failed task across all orders that has not yet
/// produced a refund event (admin dead-letter queue).
pub async fn list_unrefunded_dead_letters(pool: &PgPool) -> Result<Vec<OrderTask>> {
    let tasks = sqlx::query_as::<_, OrderTask>(
        "SELECT t.* FROM order_tasks t \
         LEFT JOIN refund_events r ON r.task_id = t.id \
         WHERE t.status = 'failed_permanent' AND r.id IS NULL \
         ORDER BY t.executed_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list unrefunded dead letters")?;

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_progress_defaults_to_zero() {
        let progress = OrderProgress::default();
        assert_eq!(progress.total, 0);
        assert_eq!(progress.completed, 0);
    }

    #[test]
    fn task_status_not_terminal_variants_match_progress_fields() {
        // Sanity check that the statuses this module switches on stay in
        // sync with TaskStatus's own variant set.
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Executing,
            TaskStatus::Completed,
            TaskStatus::FailedRetrying,
            TaskStatus::FailedPermanent,
        ];
        assert_eq!(variants.len(), 5);
    }
}
