//! `orderflow order` commands: submit, status, list.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use orderflow_core::idempotency;
use orderflow_core::registry;
use orderflow_core::scheduler::{self, capacity::WINDOW_CEILING_HOURS, CapacityError};
use orderflow_db::queries::orders as order_db;
use orderflow_db::queries::tasks as task_db;
use orderflow_db::queries::tasks::NewTask;

/// Default ceiling on the number of batch tasks a single order can split
/// into.
const DEFAULT_BATCH_CEILING: i32 = 50;

/// Submit a new order: insert the order row, plan its batch split, and
/// insert the resulting tasks.
pub async fn submit_order(
    pool: &PgPool,
    user_id: Uuid,
    service_id: &str,
    quantity: i32,
    price_per_unit: Decimal,
    target_reference: &str,
    region: Option<String>,
    idempotency_key: Option<String>,
) -> Result<()> {
    let order = order_db::insert_order(
        pool,
        &order_db::NewOrder {
            user_id,
            service_id: service_id.to_string(),
            quantity,
            price_per_unit,
            target_reference: target_reference.to_string(),
            region,
            idempotency_key,
            task_based: true,
        },
    )
    .await
    .context("failed to submit order")?;

    let existing = task_db::list_tasks_for_order(pool, order.id).await?;
    if !existing.is_empty() {
        println!("Order {} already has {} task(s) planned.", order.id, existing.len());
        return Ok(());
    }

    let selectable = registry::list_selectable(pool, None, None).await?;
    let hourly_rate: i64 = selectable.iter().map(|n| n.capacity as i64).sum();
    let already_committed = order_db::pending_load(pool).await?;

    if let Err(CapacityError::Rejected { requested, available, deficit }) = scheduler::check_admission(
        hourly_rate,
        WINDOW_CEILING_HOURS,
        already_committed,
        quantity as i64,
    ) {
        println!(
            "Order {} rejected: requested {} units but only {} available (deficit {}).",
            order.id, requested, available, deficit
        );
        return Ok(());
    }

    let mut rng = rand::rng();
    let now = Utc::now();
    let plans = scheduler::plan_batches(quantity, DEFAULT_BATCH_CEILING, now, &mut rng)
        .context("failed to plan order batches")?;

    let new_tasks: Vec<NewTask> = plans
        .iter()
        .map(|p| NewTask {
            order_id: order.id,
            sequence: p.sequence,
            quantity: p.quantity,
            max_attempts: 5,
            scheduled_at: p.scheduled_at,
            idempotency_token: idempotency::token(order.id, p.sequence, 0),
        })
        .collect();

    let tasks = task_db::insert_batch(pool, &new_tasks)
        .await
        .context("failed to plan order tasks")?;

    let estimated_completion = tasks
        .iter()
        .map(|t| t.scheduled_at)
        .max()
        .unwrap_or(now);
    order_db::mark_started(pool, order.id, estimated_completion)
        .await
        .context("failed to mark order started")?;

    println!("Order submitted: {}", order.id);
    println!("  quantity: {quantity}");
    println!("  tasks: {}", tasks.len());
    for task in &tasks {
        println!(
            "    seq {} -> {} units, scheduled {}",
            task.sequence, task.quantity, task.scheduled_at
        );
    }

    Ok(())
}

/// Show an order's status and task progress.
pub async fn show_order_status(pool: &PgPool, order_id: Uuid) -> Result<()> {
    let order = order_db::get_order(pool, order_id)
        .await?
        .with_context(|| format!("order {order_id} not found"))?;

    let progress = task_db::get_order_progress(pool, order_id).await?;

    println!("Order {}", order.id);
    println!("  status:    {}", order.status);
    println!("  quantity:  {}", order.quantity);
    println!("  delivered: {}", order.delivered);
    println!("  remains:   {}", order.remains);
    println!("  failed:    {}", order.failed_permanent);
    println!("  tasks:     {} total", progress.total);
    println!(
        "    pending={} executing={} completed={} retrying={} failed_permanent={}",
        progress.pending,
        progress.executing,
        progress.completed,
        progress.failed_retrying,
        progress.failed_permanent,
    );

    Ok(())
}

/// List every order belonging to a user, most recent first.
pub async fn list_orders(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let orders = order_db::list_orders_for_user(pool, user_id).await?;

    if orders.is_empty() {
        println!("No orders found for user {user_id}.");
        return Ok(());
    }

    for order in &orders {
        println!(
            "{}  {:<10}  qty={:<8} delivered={:<8} failed={:<6}",
            order.id, order.status, order.quantity, order.delivered, order.failed_permanent
        );
    }

    Ok(())
}
