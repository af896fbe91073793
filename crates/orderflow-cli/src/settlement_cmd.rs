//! `orderflow settlement run`: run one settlement sweep.

use anyhow::Result;
use sqlx::PgPool;

use orderflow_core::settlement;

/// Run a single settlement sweep and print the resulting report.
pub async fn run_settlement(pool: &PgPool) -> Result<()> {
    let report = settlement::run_sweep(pool).await?;

    println!("Settlement sweep complete.");
    println!("  orders_settled:  {}", report.orders_settled);
    println!("  refunds_posted:  {}", report.refunds_posted);
    println!("  anomalies_raised: {}", report.anomalies_raised);

    Ok(())
}
