//! Database query functions for the `proxy_nodes` and `proxy_metrics` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{HealthState, OperationalStatus, ProxyMetrics, ProxyNode, ProxyTier};

/// Parameters for registering a new node.
pub struct NewProxyNode {
    pub provider: String,
    pub address: String,
    pub port: i32,
    pub region: Option<String>,
    pub country: Option<String>,
    pub tier: ProxyTier,
    pub capacity: i32,
}

/// Register a node. `address` is unique, so re-registering an existing
/// address is rejected at the database level.
pub async fn register(pool: &PgPool, new: &NewProxyNode) -> Result<ProxyNode> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let node = sqlx::query_as::<_, ProxyNode>(
        "INSERT INTO proxy_nodes \
            (provider, address, port, region, country, tier, capacity, current_load, \
             operational_status, health_state) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 'online', 'healthy') \
         RETURNING *",
    )
    .bind(&new.provider)
    .bind(&new.address)
    .bind(new.port)
    .bind(&new.region)
    .bind(&new.country)
    .bind(new.tier)
    .bind(new.capacity)
    .fetch_one(&mut *tx)
    .await
    .context("failed to register proxy node")?;

    sqlx::query(
        "INSERT INTO proxy_metrics \
            (node_id, total_requests, successful_requests, failed_requests, success_rate, \
             ban_count, ban_rate, latency_p50_ms, latency_p95_ms, latency_p99_ms, \
             active_connections, peak_connections, window_start) \
         VALUES ($1, 0, 0, 0, 1.0, 0, 0.0, 0, 0, 0, 0, 0, NOW())",
    )
    .bind(node.id)
    .execute(&mut *tx)
    .await
    .context("failed to seed proxy metrics")?;

    tx.commit().await.context("failed to commit node registration")?;
    Ok(node)
}

/// Fetch a single node by ID.
pub async fn get_node(pool: &PgPool, id: Uuid) -> Result<Option<ProxyNode>> {
    let node = sqlx::query_as::<_, ProxyNode>("SELECT * FROM proxy_nodes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch proxy node")?;

    Ok(node)
}

/// List every node currently eligible for selection: `Online`, health not
/// `Offline`, and with spare capacity; optionally narrowed to a minimum
/// tier and/or a region. Ordered by (HEALTHY before DEGRADED, ascending
/// current load, ascending tier cost) so the Selector's own ranking is a
/// no-op over an already-sorted candidate list.
pub async fn list_selectable(
    pool: &PgPool,
    tier: Option<ProxyTier>,
    region: Option<&str>,
) -> Result<Vec<ProxyNode>> {
    let nodes = sqlx::query_as::<_, ProxyNode>(
        "SELECT * FROM proxy_nodes \
         WHERE operational_status = 'online' \
           AND health_state != 'offline' \
           AND current_load < capacity \
           AND ($1::text IS NULL OR tier = $1) \
           AND ($2::text IS NULL OR region = $2) \
         ORDER BY \
           CASE health_state WHEN 'healthy' THEN 0 ELSE 1 END, \
           current_load ASC, \
           CASE tier \
             WHEN 'datacenter' THEN 0 \
             WHEN 'isp' THEN 1 \
             WHEN 'tor' THEN 2 \
             WHEN 'residential' THEN 3 \
             WHEN 'mobile' THEN 4 \
           END",
    )
    .bind(tier)
    .bind(region)
    .fetch_all(pool)
    .await
    .context("failed to list selectable proxy nodes")?;

    Ok(nodes)
}

/// Fetch the metrics row for a node.
pub async fn get_metrics(pool: &PgPool, node_id: Uuid) -> Result<Option<ProxyMetrics>> {
    let metrics =
        sqlx::query_as::<_, ProxyMetrics>("SELECT * FROM proxy_metrics WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch proxy metrics")?;

    Ok(metrics)
}

/// A single dispatch outcome report used to update rolling metrics.
pub struct MetricsReport {
    pub succeeded: bool,
    pub banned: bool,
    pub latency_ms: i32,
}

/// Fold a dispatch outcome into a node's rolling metrics and recompute its
/// derived health state, all within one transaction.
pub async fn record_outcome(
    pool: &PgPool,
    node_id: Uuid,
    report: &MetricsReport,
) -> Result<HealthState> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query(
        "UPDATE proxy_metrics \
         SET total_requests = total_requests + 1, \
             successful_requests = successful_requests + $2, \
             failed_requests = failed_requests + $3, \
             ban_count = ban_count + $4, \
             success_rate = (successful_requests + $2)::float8 / GREATEST(total_requests + 1, 1), \
             ban_rate = (ban_count + $4)::float8 / GREATEST(total_requests + 1, 1) \
         WHERE node_id = $1",
    )
    .bind(node_id)
    .bind(report.succeeded as i32)
    .bind((!report.succeeded) as i32)
    .bind(report.banned as i32)
    .execute(&mut *tx)
    .await
    .context("failed to update proxy metrics")?;

    let success_rate: (f64,) =
        sqlx::query_as("SELECT success_rate FROM proxy_metrics WHERE node_id = $1")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to read back success rate")?;

    let health = HealthState::from_success_rate(success_rate.0);

    sqlx::query("UPDATE proxy_nodes SET health_state = $2 WHERE id = $1")
        .bind(node_id)
        .bind(health)
        .execute(&mut *tx)
        .await
        .context("failed to update node health state")?;

    tx.commit().await.context("failed to commit metrics update")?;
    Ok(health)
}

/// Reset a node's rolling metrics window (called on the window rollover
/// schedule).
pub async fn reset_window(pool: &PgPool, node_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE proxy_metrics \
         SET total_requests = 0, successful_requests = 0, failed_requests = 0, \
             success_rate = 1.0, ban_count = 0, ban_rate = 0.0, window_start = NOW() \
         WHERE node_id = $1",
    )
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to reset proxy metrics window")?;

    Ok(result.rows_affected())
}

/// Adjust a node's `current_load` by `delta` (positive on claim, negative
/// on release). Clamped at zero via the WHERE guard.
pub async fn adjust_load(pool: &PgPool, node_id: Uuid, delta: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE proxy_nodes SET current_load = current_load + $2 \
         WHERE id = $1 AND current_load + $2 >= 0",
    )
    .bind(node_id)
    .bind(delta)
    .execute(pool)
    .await
    .context("failed to adjust proxy node load")?;

    Ok(result.rows_affected())
}

/// Set a node's operational status (administrative action).
pub async fn set_operational_status(
    pool: &PgPool,
    node_id: Uuid,
    status: OperationalStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE proxy_nodes SET operational_status = $2 WHERE id = $1")
        .bind(node_id)
        .bind(status)
        .execute(pool)
        .await
        .context("failed to set proxy node operational status")?;

    Ok(result.rows_affected())
}

/// Node + metrics pair used by the proxy listing surface.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct NodeWithMetrics {
    pub id: Uuid,
    pub provider: String,
    pub address: String,
    pub port: i32,
    pub tier: ProxyTier,
    pub capacity: i32,
    pub current_load: i32,
    pub operational_status: OperationalStatus,
    pub health_state: HealthState,
    pub success_rate: f64,
    pub total_requests: i64,
    pub window_start: DateTime<Utc>,
}

/// List all nodes joined with their current metrics, for operator
/// visibility.
pub async fn list_with_metrics(pool: &PgPool) -> Result<Vec<NodeWithMetrics>> {
    let rows = sqlx::query_as::<_, NodeWithMetrics>(
        "SELECT n.id, n.provider, n.address, n.port, n.tier, n.capacity, n.current_load, \
                n.operational_status, n.health_state, \
                m.success_rate, m.total_requests, m.window_start \
         FROM proxy_nodes n \
         JOIN proxy_metrics m ON m.node_id = n.id \
         ORDER BY n.provider, n.address",
    )
    .fetch_all(pool)
    .await
    .context("failed to list proxy nodes with metrics")?;

    Ok(rows)
}
