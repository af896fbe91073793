//! Integration tests covering the full order lifecycle against a real
//! database: submission's admission math, a worker tick through
//! dispatch/finalize (including partial delivery), order finalization's
//! three-way outcome, and the settlement sweep's refund posting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use orderflow_core::dispatch::{DispatchOutcome, SimulatedDispatchClient};
use orderflow_core::idempotency;
use orderflow_core::scheduler::{self, CapacityError};
use orderflow_core::settlement;
use orderflow_core::worker::{DeliveryWorker, DeliveryWorkerConfig};
use orderflow_db::models::{OrderStatus, ProxyTier};
use orderflow_db::queries::orders::{self as order_db, NewOrder};
use orderflow_db::queries::tasks::{self as task_db, NewTask};
use orderflow_test_utils::{create_test_db, drop_test_db};

async fn create_test_order(pool: &sqlx::PgPool, quantity: i32) -> orderflow_db::models::Order {
    order_db::insert_order(
        pool,
        &NewOrder {
            user_id: Uuid::new_v4(),
            service_id: "followers".to_string(),
            quantity,
            price_per_unit: Decimal::new(1, 2),
            target_reference: "https://example.com/profile".to_string(),
            region: None,
            idempotency_key: None,
            task_based: true,
        },
    )
    .await
    .expect("failed to insert test order")
}

async fn create_test_task(
    pool: &sqlx::PgPool,
    order_id: Uuid,
    sequence: i32,
    quantity: i32,
) -> orderflow_db::models::OrderTask {
    let tasks = task_db::insert_batch(
        pool,
        &[NewTask {
            order_id,
            sequence,
            quantity,
            max_attempts: 3,
            scheduled_at: Utc::now(),
            idempotency_token: idempotency::token(order_id, sequence, 0),
        }],
    )
    .await
    .expect("failed to insert test task");
    tasks.into_iter().next().unwrap()
}

async fn register_healthy_node(pool: &sqlx::PgPool, capacity: i32) -> orderflow_db::models::ProxyNode {
    orderflow_core::registry::register(
        pool,
        "acme",
        "127.0.0.1",
        8080,
        ProxyTier::Datacenter,
        capacity,
        None,
        None,
    )
    .await
    .expect("failed to register proxy node")
}

fn worker_with(outcome: DispatchOutcome) -> (DeliveryWorkerConfig, Arc<SimulatedDispatchClient>) {
    let config = DeliveryWorkerConfig {
        worker_id: format!("test-worker-{}", Uuid::new_v4()),
        batch_size: 10,
        concurrency: 2,
        poll_interval: Duration::from_millis(10),
        orphan_threshold: Duration::from_secs(30),
        backoff_ceiling: Duration::from_secs(3600),
    };
    (config, Arc::new(SimulatedDispatchClient::always(outcome)))
}

#[tokio::test]
async fn full_delivery_completes_order_and_needs_no_refund() {
    let (pool, db_name) = create_test_db().await;

    register_healthy_node(&pool, 100).await;
    let order = create_test_order(&pool, 10).await;
    create_test_task(&pool, order.id, 0, 10).await;
    order_db::mark_started(&pool, order.id, Utc::now())
        .await
        .unwrap();

    let (config, dispatch) = worker_with(DispatchOutcome::Delivered { plays_delivered: 10 });
    let worker = DeliveryWorker::new(pool.clone(), dispatch, config);
    worker.tick().await.unwrap();

    let updated = order_db::get_order(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(updated.status, OrderStatus::Completed);
    assert_eq!(updated.delivered, 10);
    assert_eq!(updated.remains, 0);
    assert_eq!(updated.failed_permanent, 0);

    // Full delivery finalizes inline (the worker tick already drove it to
    // `completed`), so a later settlement sweep has nothing left to do --
    // only `running`/`partial`/`failed` orders are settleable.
    let report = settlement::run_sweep(&pool).await.unwrap();
    assert_eq!(report.orders_settled, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn partial_delivery_credits_remainder_and_retries_same_task() {
    let (pool, db_name) = create_test_db().await;

    register_healthy_node(&pool, 100).await;
    let order = create_test_order(&pool, 10).await;
    let task = create_test_task(&pool, order.id, 0, 10).await;
    order_db::mark_started(&pool, order.id, Utc::now())
        .await
        .unwrap();

    let (config, dispatch) = worker_with(DispatchOutcome::Delivered { plays_delivered: 6 });
    let worker = DeliveryWorker::new(pool.clone(), dispatch, config);
    worker.tick().await.unwrap();

    let updated_order = order_db::get_order(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(updated_order.delivered, 6, "the 6 delivered units should be credited");
    assert_eq!(updated_order.remains, 4, "the shortfall stays owed");
    assert_eq!(updated_order.status, OrderStatus::Running, "order is not yet finalized");

    let remaining_task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(remaining_task.quantity, 4, "the task's own quantity shrinks by what was delivered");
    assert_eq!(remaining_task.status, orderflow_db::models::TaskStatus::FailedRetrying);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn permanent_failure_refunds_and_finalizes_as_failed() {
    let (pool, db_name) = create_test_db().await;

    register_healthy_node(&pool, 100).await;
    let order = create_test_order(&pool, 10).await;
    create_test_task(&pool, order.id, 0, 10).await;
    order_db::mark_started(&pool, order.id, Utc::now())
        .await
        .unwrap();

    let (config, dispatch) = worker_with(DispatchOutcome::Permanent {
        reason: "target account suspended".into(),
    });
    let worker = DeliveryWorker::new(pool.clone(), dispatch, config);
    worker.tick().await.unwrap();

    let updated = order_db::get_order(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(updated.failed_permanent, 10);
    assert_eq!(updated.delivered, 0);
    assert_eq!(updated.status, OrderStatus::Failed, "nothing delivered -> failed, not partial");

    let report = settlement::run_sweep(&pool).await.unwrap();
    assert_eq!(report.orders_settled, 1);
    assert_eq!(report.refunds_posted, 1);

    let finalized = order_db::get_order(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(finalized.status, OrderStatus::Refunded);

    // A second sweep over an already-settled order must not double-post.
    let report2 = settlement::run_sweep(&pool).await.unwrap();
    assert_eq!(report2.orders_settled, 0, "order no longer appears as settleable");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mixed_outcomes_finalize_as_partial() {
    let (pool, db_name) = create_test_db().await;

    register_healthy_node(&pool, 100).await;
    let order = create_test_order(&pool, 20).await;
    create_test_task(&pool, order.id, 0, 10).await;
    create_test_task(&pool, order.id, 1, 10).await;
    order_db::mark_started(&pool, order.id, Utc::now())
        .await
        .unwrap();

    let (config_ok, dispatch_ok) = worker_with(DispatchOutcome::Delivered { plays_delivered: 10 });
    let worker_ok = DeliveryWorker::new(pool.clone(), dispatch_ok, config_ok);
    worker_ok.tick().await.unwrap();

    let (config_fail, dispatch_fail) = worker_with(DispatchOutcome::Permanent {
        reason: "banned".into(),
    });
    let worker_fail = DeliveryWorker::new(pool.clone(), dispatch_fail, config_fail);
    worker_fail.tick().await.unwrap();

    let updated = order_db::get_order(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(updated.delivered, 10);
    assert_eq!(updated.failed_permanent, 10);
    assert_eq!(updated.status, OrderStatus::Partial);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn admission_check_rejects_when_capacity_is_insufficient() {
    let (pool, db_name) = create_test_db().await;

    // One node with capacity 5: hourly_rate=5, window=72h budget=360.
    register_healthy_node(&pool, 5).await;

    let already_committed = order_db::pending_load(&pool).await.unwrap();
    assert_eq!(already_committed, 0);

    let decision = scheduler::check_admission(
        5,
        scheduler::capacity::WINDOW_CEILING_HOURS,
        already_committed,
        1000,
    );

    match decision {
        Err(CapacityError::Rejected { requested, available, deficit }) => {
            assert_eq!(requested, 1000);
            assert_eq!(available, 360);
            assert_eq!(deficit, 1000 - 360);
        }
        other => panic!("expected a Rejected admission decision, got {other:?}"),
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn admission_check_accounts_for_already_committed_load() {
    let (pool, db_name) = create_test_db().await;

    register_healthy_node(&pool, 10).await;
    let committed_order = create_test_order(&pool, 500).await;
    order_db::mark_started(&pool, committed_order.id, Utc::now())
        .await
        .unwrap();

    let already_committed = order_db::pending_load(&pool).await.unwrap();
    assert_eq!(already_committed, 500);

    // hourly_rate=10, window=72h -> budget 720, minus 500 committed = 220 left.
    let decision = scheduler::check_admission(
        10,
        scheduler::capacity::WINDOW_CEILING_HOURS,
        already_committed,
        300,
    );
    assert!(matches!(decision, Err(CapacityError::Rejected { .. })));

    let decision_ok = scheduler::check_admission(
        10,
        scheduler::capacity::WINDOW_CEILING_HOURS,
        already_committed,
        200,
    );
    assert!(decision_ok.is_ok());

    pool.close().await;
    drop_test_db(&db_name).await;
}
