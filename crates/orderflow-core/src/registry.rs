//! Proxy registry and health evaluator.
//!
//! Wraps the lower-level `orderflow_db::queries::proxy_nodes` functions
//! with the domain operations the worker and admin surfaces need:
//! registration, outcome reporting (which folds into the rolling health
//! window), and window rollover.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use orderflow_db::models::{HealthState, OperationalStatus, ProxyNode, ProxyTier};
use orderflow_db::queries::proxy_nodes::{self as db, MetricsReport, NewProxyNode};

/// Register a new egress node with the registry.
pub async fn register(
    pool: &PgPool,
    provider: impl Into<String>,
    address: impl Into<String>,
    port: i32,
    tier: ProxyTier,
    capacity: i32,
    region: Option<String>,
    country: Option<String>,
) -> Result<ProxyNode> {
    db::register(
        pool,
        &NewProxyNode {
            provider: provider.into(),
            address: address.into(),
            port,
            region,
            country,
            tier,
            capacity,
        },
    )
    .await
}

/// List every node currently eligible for selection, optionally narrowed
/// to a minimum tier and/or a region, ordered by (HEALTHY before
/// DEGRADED, ascending load, ascending tier cost).
pub async fn list_selectable(
    pool: &PgPool,
    tier: Option<ProxyTier>,
    region: Option<&str>,
) -> Result<Vec<ProxyNode>> {
    db::list_selectable(pool, tier, region).await
}

/// Fold one dispatch outcome into a node's rolling metrics, recompute its
/// health band, and return the new [`HealthState`].
pub async fn report_outcome(
    pool: &PgPool,
    node_id: Uuid,
    succeeded: bool,
    banned: bool,
    latency_ms: i32,
) -> Result<HealthState> {
    db::record_outcome(
        pool,
        node_id,
        &MetricsReport {
            succeeded,
            banned,
            latency_ms,
        },
    )
    .await
}

/// Reset a node's rolling metrics window.
pub async fn reset_window(pool: &PgPool, node_id: Uuid) -> Result<()> {
    db::reset_window(pool, node_id).await?;
    Ok(())
}

/// Claim capacity on a node ahead of dispatch.
pub async fn claim_capacity(pool: &PgPool, node_id: Uuid) -> Result<()> {
    db::adjust_load(pool, node_id, 1).await?;
    Ok(())
}

/// Release capacity on a node after dispatch completes.
pub async fn release_capacity(pool: &PgPool, node_id: Uuid) -> Result<()> {
    db::adjust_load(pool, node_id, -1).await?;
    Ok(())
}

/// Administratively change a node's operational status (e.g. taking a
/// node offline for maintenance, or marking it banned).
pub async fn set_operational_status(
    pool: &PgPool,
    node_id: Uuid,
    status: OperationalStatus,
) -> Result<()> {
    db::set_operational_status(pool, node_id, status).await?;
    Ok(())
}
