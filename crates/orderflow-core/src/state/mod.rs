//! Task state machine transitions.
//!
//! Validates and executes state transitions for order tasks, enforcing
//! the allowed transition graph and optimistic locking. Claiming and
//! orphan recovery are handled separately by [`crate::worker`] since they
//! operate on batches rather than a single task by id.

pub mod queries;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orderflow_db::models::TaskStatus;
use orderflow_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending          -> executing         (claim; batch op, see crate::worker)
/// executing        -> completed
/// executing        -> failed_retrying
/// executing        -> failed_permanent
/// failed_retrying  -> executing         (claim; batch op, see crate::worker)
/// executing        -> pending           (orphan recovery; batch op, see crate::worker)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Executing)
                | (TaskStatus::Executing, TaskStatus::Completed)
                | (TaskStatus::Executing, TaskStatus::FailedRetrying)
                | (TaskStatus::Executing, TaskStatus::FailedPermanent)
                | (TaskStatus::FailedRetrying, TaskStatus::Executing)
                | (TaskStatus::Executing, TaskStatus::Pending)
        )
    }

    /// Finalize a claimed task as completed.
    ///
    /// Returns an error if the transition is not legal, the task does not
    /// exist, or the optimistic lock on `(status, worker_id)` fails
    /// (meaning the worker has since been declared orphaned).
    pub async fn complete(
        pool: &PgPool,
        task_id: Uuid,
        worker_id: &str,
        proxy_node_id: Option<Uuid>,
    ) -> Result<()> {
        let rows = db::finalize_completed(pool, task_id, worker_id, proxy_node_id)
            .await
            .with_context(|| format!("failed to complete task {task_id}"))?;

        Self::check_finalize_rows(pool, task_id, rows).await
    }

    /// Finalize a claimed task as a transient failure eligible for retry.
    pub async fn retry(
        pool: &PgPool,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: chrono::DateTime<chrono::Utc>,
        new_idempotency_token: &str,
    ) -> Result<()> {
        let rows = db::finalize_retry(
            pool,
            task_id,
            worker_id,
            error,
            retry_after,
            new_idempotency_token,
        )
        .await
        .with_context(|| format!("failed to schedule retry for task {task_id}"))?;

        Self::check_finalize_rows(pool, task_id, rows).await
    }

    /// Finalize a claimed task as a permanent failure (attempts
    /// exhausted).
    pub async fn fail_permanently(
        pool: &PgPool,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<()> {
        let rows = db::finalize_permanent_failure(pool, task_id, worker_id, error)
            .await
            .with_context(|| format!("failed to permanently fail task {task_id}"))?;

        Self::check_finalize_rows(pool, task_id, rows).await
    }

    async fn check_finalize_rows(pool: &PgPool, task_id: Uuid, rows: u64) -> Result<()> {
        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {task_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {} and worker {:?}, expected a live claim",
                    task_id,
                    t.status,
                    t.worker_id
                ),
            }
        }
        Ok(())
    }
}
