//! Database query functions for the `refund_events`, `balance_transactions`,
//! and `refund_anomalies` tables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AnomalySeverity, BalanceTransaction, BalanceTxnType, RefundAnomaly, RefundEvent};

/// Record one failed task's Refund Event. `task_id` is unique on
/// `refund_events`, so a retried settlement pass cannot double-record the
/// same task.
///
/// This writes the per-task ledger entry only; it does not move money.
/// The caller is responsible for posting exactly one Balance Transaction
/// per order summing every Refund Event it produced (see
/// [`post_balance_transaction`]), per the one-refund-transaction-per-order
/// invariant.
///
/// Returns `None` if a refund event for this task already exists.
pub async fn post_refund(
    pool: &PgPool,
    order_id: Uuid,
    task_id: Uuid,
    user_id: Uuid,
    quantity: i32,
    price_per_unit: Decimal,
    worker_id: Option<&str>,
) -> Result<Option<RefundEvent>> {
    let amount = (price_per_unit * Decimal::from(quantity))
        .round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero);

    let refund = sqlx::query_as::<_, RefundEvent>(
        "INSERT INTO refund_events \
            (order_id, task_id, user_id, quantity, amount, price_per_unit, worker_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (task_id) DO NOTHING \
         RETURNING *",
    )
    .bind(order_id)
    .bind(task_id)
    .bind(user_id)
    .bind(quantity)
    .bind(amount)
    .bind(price_per_unit)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("failed to insert refund event")?;

    Ok(refund)
}

/// Post an arbitrary balance transaction (debit on order admission, credit
/// on refund, bonus, manual adjustment), returning the new balance.
pub async fn post_balance_transaction(
    pool: &PgPool,
    user_id: Uuid,
    amount: Decimal,
    txn_type: BalanceTxnType,
    reason: &str,
    order_id: Option<Uuid>,
) -> Result<BalanceTransaction> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let txn =
        post_balance_transaction_in(&mut tx, user_id, amount, txn_type, reason, order_id).await?;
    tx.commit().await.context("failed to commit balance transaction")?;
    Ok(txn)
}

async fn post_balance_transaction_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    amount: Decimal,
    txn_type: BalanceTxnType,
    reason: &str,
    order_id: Option<Uuid>,
) -> Result<BalanceTransaction> {
    let current_balance: Decimal = sqlx::query_scalar(
        "SELECT COALESCE(SUM( \
            CASE WHEN txn_type IN ('credit', 'refund', 'bonus') THEN amount ELSE -amount END \
         ), 0) FROM balance_transactions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to compute current balance")?;

    let balance_after = match txn_type {
        BalanceTxnType::Credit | BalanceTxnType::Refund | BalanceTxnType::Bonus => {
            current_balance + amount
        }
        BalanceTxnType::Debit | BalanceTxnType::Adjustment => current_balance - amount,
    };

    let txn = sqlx::query_as::<_, BalanceTransaction>(
        "INSERT INTO balance_transactions \
            (user_id, amount, balance_before, balance_after, txn_type, reason, order_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(user_id)
    .bind(amount)
    .bind(current_balance)
    .bind(balance_after)
    .bind(txn_type)
    .bind(reason)
    .bind(order_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert balance transaction")?;

    Ok(txn)
}

/// Whether a REFUND balance transaction has already been posted for this
/// order. Settlement consults this before posting its summary
/// transaction so a re-run (sweep re-visiting an order, or a direct
/// re-invocation) never posts a second one.
pub async fn refund_transaction_posted(pool: &PgPool, order_id: Uuid) -> Result<bool> {
    let exists: (bool,) = sqlx::query_as(
        "SELECT EXISTS( \
            SELECT 1 FROM balance_transactions \
            WHERE order_id = $1 AND txn_type = 'refund' \
         )",
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
    .context("failed to check for an existing refund transaction")?;

    Ok(exists.0)
}

/// Fetch a user's current balance (derived from the ledger, never stored
/// directly).
pub async fn get_balance(pool: &PgPool, user_id: Uuid) -> Result<Decimal> {
    let balance: Decimal = sqlx::query_scalar(
        "SELECT COALESCE(SUM( \
            CASE WHEN txn_type IN ('credit', 'refund', 'bonus') THEN amount ELSE -amount END \
         ), 0) FROM balance_transactions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to fetch user balance")?;

    Ok(balance)
}

/// Record a reconciliation discrepancy between an order's expected and
/// actual refund totals.
pub async fn record_anomaly(
    pool: &PgPool,
    order_id: Uuid,
    delta: Decimal,
    description: &str,
    expected: Decimal,
    actual: Decimal,
) -> Result<RefundAnomaly> {
    let severity = AnomalySeverity::from_delta(delta);

    let anomaly = sqlx::query_as::<_, RefundAnomaly>(
        "INSERT INTO refund_anomalies (order_id, severity, description, expected, actual) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(order_id)
    .bind(severity)
    .bind(description)
    .bind(expected)
    .bind(actual)
    .fetch_one(pool)
    .await
    .context("failed to record refund anomaly")?;

    Ok(anomaly)
}

/// List anomalies at or above a given severity, most recent first.
///
/// Severity is stored as text, so the ordering is computed in Rust and
/// passed down as an explicit `IN (...)` set rather than relying on
/// lexicographic comparison of the stored strings.
pub async fn list_anomalies_since_severity(
    pool: &PgPool,
    min_severity: AnomalySeverity,
) -> Result<Vec<RefundAnomaly>> {
    let included: Vec<AnomalySeverity> = [
        AnomalySeverity::Info,
        AnomalySeverity::Warning,
        AnomalySeverity::Critical,
    ]
    .into_iter()
    .filter(|s| *s >= min_severity)
    .collect();

    let anomalies = sqlx::query_as::<_, RefundAnomaly>(
        "SELECT * FROM refund_anomalies WHERE severity = ANY($1) ORDER BY created_at DESC",
    )
    .bind(&included)
    .fetch_all(pool)
    .await
    .context("failed to list refund anomalies")?;

    Ok(anomalies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_amount_rounds_half_up_to_two_places() {
        let price = Decimal::new(15, 3); // 0.015
        let qty = Decimal::from(3);
        let amount = (price * qty)
            .round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
        // 0.015 * 3 = 0.045 -> rounds to 0.05
        assert_eq!(amount, Decimal::new(5, 2));
    }
}
