//! Database query functions for the `orders` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Order, OrderStatus};

/// Parameters for a new order submission.
pub struct NewOrder {
    pub user_id: Uuid,
    pub service_id: String,
    pub quantity: i32,
    pub price_per_unit: Decimal,
    pub target_reference: String,
    pub region: Option<String>,
    pub idempotency_key: Option<String>,
    pub task_based: bool,
}

/// Insert a new order. When `idempotency_key` is set and a row with that
/// key already exists, the existing row is returned instead of creating a
/// duplicate (admission is a create-or-fetch operation).
pub async fn insert_order(pool: &PgPool, new: &NewOrder) -> Result<Order> {
    if let Some(key) = &new.idempotency_key {
        if let Some(existing) = get_order_by_idempotency_key(pool, key).await? {
            return Ok(existing);
        }
    }

    let order = sqlx::query_as::<_, Order>(
        "INSERT INTO orders \
            (user_id, service_id, quantity, price_per_unit, target_reference, region, \
             idempotency_key, task_based, status, delivered, remains, failed_permanent) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $3, 0) \
         RETURNING *",
    )
    .bind(new.user_id)
    .bind(&new.service_id)
    .bind(new.quantity)
    .bind(new.price_per_unit)
    .bind(&new.target_reference)
    .bind(&new.region)
    .bind(&new.idempotency_key)
    .bind(new.task_based)
    .fetch_one(pool)
    .await
    .context("failed to insert order")?;

    Ok(order)
}

/// Fetch a single order by ID.
pub async fn get_order(pool: &PgPool, id: Uuid) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch order")?;

    Ok(order)
}

/// Fetch an order by its idempotency key, if any order was submitted with
/// one.
pub async fn get_order_by_idempotency_key(pool: &PgPool, key: &str) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE idempotency_key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch order by idempotency key")?;

    Ok(order)
}

/// List orders for a user, most recent first.
pub async fn list_orders_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list orders for user")?;

    Ok(orders)
}

/// Transition an order's status, optimistic-locked on its current status.
pub async fn transition_status(
    pool: &PgPool,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders SET status = $1 WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(order_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition order status")?;

    Ok(result.rows_affected())
}

/// Mark an order as started, setting `started_at` and `estimated_completion`
/// once, on the `Pending -> Running` transition.
pub async fn mark_started(
    pool: &PgPool,
    order_id: Uuid,
    estimated_completion: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders \
         SET status = 'running', started_at = NOW(), estimated_completion = $2 \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(order_id)
    .bind(estimated_completion)
    .execute(pool)
    .await
    .context("failed to mark order started")?;

    Ok(result.rows_affected())
}

/// Atomically add `delivered_delta` units to `delivered` and subtract them
/// from `remains`. Guards `remains` against going negative via the WHERE
/// clause, so a racing double-count is rejected rather than corrupting the
/// counter.
pub async fn apply_delivery(pool: &PgPool, order_id: Uuid, delivered_delta: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders \
         SET delivered = delivered + $2, remains = remains - $2 \
         WHERE id = $1 AND remains >= $2",
    )
    .bind(order_id)
    .bind(delivered_delta)
    .execute(pool)
    .await
    .context("failed to apply delivery counters")?;

    Ok(result.rows_affected())
}

/// Atomically add `failed_delta` units to `failed_permanent` and subtract
/// them from `remains`.
pub async fn apply_permanent_failure(
    pool: &PgPool,
    order_id: Uuid,
    failed_delta: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders \
         SET failed_permanent = failed_permanent + $2, remains = remains - $2 \
         WHERE id = $1 AND remains >= $2",
    )
    .bind(order_id)
    .bind(failed_delta)
    .execute(pool)
    .await
    .context("failed to apply permanent failure counters")?;

    Ok(result.rows_affected())
}

/// Finalize an order's terminal status once `remains` reaches zero:
/// `Completed` when nothing failed, `Failed` when nothing was delivered,
/// `Partial` otherwise. Sets `completed_at`.
pub async fn finalize(pool: &PgPool, order_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders \
         SET status = CASE \
                 WHEN failed_permanent = 0 THEN 'completed' \
                 WHEN delivered = 0 THEN 'failed' \
                 ELSE 'partial' \
             END, \
             completed_at = NOW() \
         WHERE id = $1 AND status = 'running' AND remains = 0",
    )
    .bind(order_id)
    .execute(pool)
    .await
    .context("failed to finalize order")?;

    Ok(result.rows_affected())
}

/// Mark an order `Refunded` once its settlement pass has posted every
/// owed refund.
pub async fn mark_refunded(pool: &PgPool, order_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE orders SET status = 'refunded' \
         WHERE id = $1 AND status IN ('partial', 'failed')",
    )
    .bind(order_id)
    .execute(pool)
    .await
    .context("failed to mark order refunded")?;

    Ok(result.rows_affected())
}

/// Sum of `remains` across every order not yet in a terminal status --
/// the throughput already promised to other orders, used by the Capacity
/// Planner's admission check.
pub async fn pending_load(pool: &PgPool) -> Result<i64> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(remains)::bigint FROM orders WHERE status IN ('pending', 'running')",
    )
    .fetch_one(pool)
    .await
    .context("failed to sum pending order load")?;

    Ok(row.0.unwrap_or(0))
}

/// List orders whose every task is terminal but which have not yet been
/// finalized or refunded (settlement sweep input).
pub async fn list_settleable(pool: &PgPool) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
        "SELECT o.* FROM orders o \
         WHERE o.status IN ('running', 'partial', 'failed') \
           AND NOT EXISTS ( \
               SELECT 1 FROM order_tasks t \
               WHERE t.order_id = o.id AND t.status NOT IN ('completed', 'failed_permanent') \
           ) \
         ORDER BY o.created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list settleable orders")?;

    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_order_carries_decimal_price() {
        let new = NewOrder {
            user_id: Uuid::nil(),
            service_id: "followers".into(),
            quantity: 1000,
            price_per_unit: Decimal::new(5, 3),
            target_reference: "https://example.com/post".into(),
            region: None,
            idempotency_key: None,
            task_based: false,
        };
        assert_eq!(new.price_per_unit.to_string(), "0.005");
    }
}
