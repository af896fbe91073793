//! Query helpers for order/task progress tracking.
//!
//! These re-export and wrap the lower-level DB queries from
//! [`orderflow_db::queries::tasks`] for use in the worker and settlement
//! layers.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use orderflow_db::models::OrderTask;
pub use orderflow_db::queries::tasks::OrderProgress;

/// List all tasks belonging to an order, in sequence order.
pub async fn list_tasks_for_order(pool: &PgPool, order_id: Uuid) -> Result<Vec<OrderTask>> {
    orderflow_db::queries::tasks::list_tasks_for_order(pool, order_id).await
}

/// Get a progress summary (counts by status) for an order.
pub async fn get_order_progress(pool: &PgPool, order_id: Uuid) -> Result<OrderProgress> {
    orderflow_db::queries::tasks::get_order_progress(pool, order_id).await
}

/// Check whether every task in an order has reached a terminal status.
pub async fn is_order_complete(pool: &PgPool, order_id: Uuid) -> Result<bool> {
    orderflow_db::queries::tasks::is_order_complete(pool, order_id).await
}
