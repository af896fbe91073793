use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use orderflow_db::models::{AnomalySeverity, Order, OrderTask, RefundAnomaly};
use orderflow_db::queries::tasks::OrderProgress;
use orderflow_db::queries::{
    orders as order_db, proxy_nodes as node_db, refunds as refund_db, tasks as task_db,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub pending: i64,
    pub executing: i64,
    pub completed: i64,
    pub failed_retrying: i64,
    pub failed_permanent: i64,
    pub total: i64,
}

impl From<OrderProgress> for ProgressResponse {
    fn from(p: OrderProgress) -> Self {
        Self {
            pending: p.pending,
            executing: p.executing,
            completed: p.completed,
            failed_retrying: p.failed_retrying,
            failed_permanent: p.failed_permanent,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderSummaryResponse {
    #[serde(flatten)]
    pub order: Order,
    pub progress: ProgressResponse,
}

#[derive(Debug, Serialize)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: Order,
    pub progress: ProgressResponse,
    pub dead_letters: Vec<OrderTask>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: PgPool) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/orders", get(list_orders_handler))
        .route("/api/orders/{id}", get(get_order_detail))
        .route("/api/orders/{id}/tasks", get(list_order_tasks))
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/dead-letters", get(list_dead_letters))
        .route("/api/anomalies", get(list_anomalies_handler))
        .layer(CorsLayer::permissive())
        .with_state(pool)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("orderflow admin surface listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("orderflow admin surface shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(pool): State<PgPool>) -> Result<axum::response::Response, AppError> {
    let nodes = node_db::list_with_metrics(&pool)
        .await
        .map_err(AppError::internal)?;

    let rows = if nodes.is_empty() {
        "<tr><td colspan=\"4\">No nodes registered.</td></tr>".to_string()
    } else {
        nodes
            .iter()
            .map(|n| {
                format!(
                    "<tr><td>{id}</td><td>{addr}:{port}</td><td>{tier}</td><td>{health}</td></tr>",
                    id = n.id,
                    addr = n.address,
                    port = n.port,
                    tier = n.tier,
                    health = n.health_state,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>orderflow</title></head><body>\
<h1>orderflow</h1>\
<p><a href=\"/api/orders\">/api/orders</a> | <a href=\"/api/nodes\">/api/nodes</a> | \
<a href=\"/api/dead-letters\">/api/dead-letters</a> | <a href=\"/api/anomalies\">/api/anomalies</a></p>\
<table><tr><th>Node</th><th>Address</th><th>Tier</th><th>Health</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_orders_handler(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let orders = order_db::list_settleable(&pool)
        .await
        .map_err(AppError::internal)?;

    let mut results = Vec::with_capacity(orders.len());
    for order in orders {
        let progress = task_db::get_order_progress(&pool, order.id)
            .await
            .map_err(AppError::internal)?;
        results.push(OrderSummaryResponse {
            order,
            progress: progress.into(),
        });
    }

    Ok(Json(results).into_response())
}

async fn get_order_detail(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let order = order_db::get_order(&pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("order {id} not found")))?;

    let progress = task_db::get_order_progress(&pool, id)
        .await
        .map_err(AppError::internal)?;

    let all_dead_letters = task_db::list_permanently_failed(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(OrderDetailResponse {
        order,
        progress: progress.into(),
        dead_letters: all_dead_letters,
    })
    .into_response())
}

async fn list_order_tasks(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_tasks_for_order(&pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(tasks).into_response())
}

async fn list_nodes_handler(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let nodes = node_db::list_with_metrics(&pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(nodes).into_response())
}

async fn list_dead_letters(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let dead_letters = task_db::list_unrefunded_dead_letters(&pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(dead_letters).into_response())
}

async fn list_anomalies_handler(
    State(pool): State<PgPool>,
) -> Result<axum::response::Response, AppError> {
    let anomalies: Vec<RefundAnomaly> =
        refund_db::list_anomalies_since_severity(&pool, AnomalySeverity::Info)
            .await
            .map_err(AppError::internal)?;

    Ok(Json(anomalies).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
