//! Settlement and refund ledger.
//!
//! Runs as a periodic sweep over orders whose tasks have all reached a
//! terminal status: posts a refund for every permanently-failed task
//! that has not yet been refunded, reconciles the order's aggregate
//! counters against the ledger, and finalizes the order's terminal
//! status.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use orderflow_db::models::{BalanceTxnType, Order};
use orderflow_db::queries::{orders as order_db, refunds as refund_db, tasks as task_db};

/// Outcome of one order's settlement pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SettlementReport {
    pub orders_settled: u64,
    pub refunds_posted: u64,
    pub anomalies_raised: u64,
}

/// Run one settlement sweep across every order ready to be settled.
pub async fn run_sweep(pool: &PgPool) -> Result<SettlementReport> {
    let orders = order_db::list_settleable(pool)
        .await
        .context("failed to list settleable orders")?;

    let mut report = SettlementReport::default();
    for order in orders {
        let outcome = settle_order(pool, &order).await?;
        report.orders_settled += 1;
        report.refunds_posted += outcome.refunds_posted;
        if outcome.anomaly_raised {
            report.anomalies_raised += 1;
        }
    }

    Ok(report)
}

struct OrderSettlementOutcome {
    refunds_posted: u64,
    anomaly_raised: bool,
}

async fn settle_order(pool: &PgPool, order: &Order) -> Result<OrderSettlementOutcome> {
    let dead_letters = task_db::list_permanently_failed(pool, order.id).await?;

    let mut refunds_posted = 0u64;
    for task in &dead_letters {
        let posted = refund_db::post_refund(
            pool,
            order.id,
            task.id,
            order.user_id,
            task.quantity,
            order.price_per_unit,
            task.worker_id.as_deref(),
        )
        .await
        .with_context(|| format!("failed to post refund for task {}", task.id))?;

        if posted.is_some() {
            refunds_posted += 1;
        }
    }

    // Exactly one Balance Transaction of type REFUND per order, summing
    // every Refund Event it owns -- never one per dead-letter task.
    if !refund_db::refund_transaction_posted(pool, order.id).await? {
        let total_amount = total_refunded(pool, order.id).await?;
        if total_amount > Decimal::ZERO {
            refund_db::post_balance_transaction(
                pool,
                order.user_id,
                total_amount,
                BalanceTxnType::Refund,
                "order tasks permanently failed",
                Some(order.id),
            )
            .await
            .context("failed to post settlement refund transaction")?;
        }
    }

    order_db::finalize(pool, order.id).await?;

    let anomaly_raised = reconcile(pool, order).await?;

    if order.failed_permanent > 0 {
        order_db::mark_refunded(pool, order.id).await?;
    }

    info!(
        order_id = %order.id,
        refunds_posted,
        anomaly_raised,
        "order settled"
    );

    Ok(OrderSettlementOutcome {
        refunds_posted,
        anomaly_raised,
    })
}

/// Compare the order's `failed_permanent` counter against the sum of
/// posted refund amounts and raise a [`orderflow_db::models::RefundAnomaly`]
/// if they diverge beyond rounding tolerance.
async fn reconcile(pool: &PgPool, order: &Order) -> Result<bool> {
    let expected = order.price_per_unit * Decimal::from(order.failed_permanent);
    let actual = total_refunded(pool, order.id).await?;
    let delta = expected - actual;

    if delta.abs() <= Decimal::new(1, 2) {
        return Ok(false);
    }

    warn!(order_id = %order.id, %expected, %actual, %delta, "refund reconciliation mismatch");
    refund_db::record_anomaly(
        pool,
        order.id,
        delta,
        "refunded amount diverges from expected permanent-failure value",
        expected,
        actual,
    )
    .await?;
    Ok(true)
}

async fn total_refunded(pool: &PgPool, order_id: Uuid) -> Result<Decimal> {
    let row: (Option<Decimal>,) =
        sqlx::query_as("SELECT SUM(amount) FROM refund_events WHERE order_id = $1")
            .bind(order_id)
            .fetch_one(pool)
            .await
            .context("failed to sum refund events")?;

    Ok(row.0.unwrap_or_default())
}

/// Credit a user's balance directly (administrative bonus or manual
/// adjustment), outside the task-failure refund path.
pub async fn post_manual_adjustment(
    pool: &PgPool,
    user_id: Uuid,
    amount: Decimal,
    txn_type: BalanceTxnType,
    reason: &str,
) -> Result<Decimal> {
    let txn = refund_db::post_balance_transaction(pool, user_id, amount, txn_type, reason, None)
        .await
        .context("failed to post manual balance adjustment")?;
    Ok(txn.balance_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_report_defaults_to_zero() {
        let report = SettlementReport::default();
        assert_eq!(report.orders_settled, 0);
        assert_eq!(report.refunds_posted, 0);
    }
}
