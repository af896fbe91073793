//! `orderflow node` commands: register, list, report-metrics.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orderflow_core::registry;
use orderflow_db::models::ProxyTier;
use orderflow_db::queries::proxy_nodes;

/// Register a new egress node.
pub async fn register_node(
    pool: &PgPool,
    provider: &str,
    address: &str,
    port: i32,
    tier: ProxyTier,
    capacity: i32,
    region: Option<String>,
    country: Option<String>,
) -> Result<()> {
    let node = registry::register(pool, provider, address, port, tier, capacity, region, country)
        .await
        .context("failed to register proxy node")?;

    println!("Node registered: {}", node.id);
    println!("  {}:{} ({}, {})", node.address, node.port, node.provider, node.tier);

    Ok(())
}

/// List every node with its current metrics.
pub async fn list_nodes(pool: &PgPool) -> Result<()> {
    let nodes = proxy_nodes::list_with_metrics(pool).await?;

    if nodes.is_empty() {
        println!("No proxy nodes registered.");
        return Ok(());
    }

    for node in &nodes {
        println!(
            "{}  {:<8}  {}:{:<6}  {:<10}  load={}/{:<4}  success_rate={:.3}  requests={}",
            node.id,
            node.tier,
            node.address,
            node.port,
            node.health_state,
            node.current_load,
            node.capacity,
            node.success_rate,
            node.total_requests,
        );
    }

    Ok(())
}

/// Report a dispatch outcome against a node from the command line (useful
/// for manually seeding or testing the health evaluator).
pub async fn report_metrics(
    pool: &PgPool,
    node_id: Uuid,
    succeeded: bool,
    banned: bool,
    latency_ms: i32,
) -> Result<()> {
    let health = registry::report_outcome(pool, node_id, succeeded, banned, latency_ms).await?;
    println!("Node {node_id} health is now {health}.");
    Ok(())
}
