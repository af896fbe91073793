//! The `DispatchClient` trait -- the adapter interface for the external
//! fulfillment collaborator that actually performs one unit of delivery
//! work against a target.
//!
//! Every dispatch implementation wraps a specific integration (a
//! provider's delivery API, a simulator for tests) and translates its
//! outcome into [`DispatchOutcome`]. The trait is intentionally
//! object-safe so it can be stored as `Arc<dyn DispatchClient>` in the
//! worker loop.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use orderflow_db::models::ProxyNode;

/// A single task's work order handed to the dispatch boundary.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: Uuid,
    pub order_id: Uuid,
    pub service_id: String,
    pub target_reference: String,
    pub quantity: i32,
    pub idempotency_token: String,
}

/// The result of attempting one dispatch.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// `plays_delivered` units were delivered, `0 < plays_delivered <=
    /// quantity`. A count equal to the requested quantity is full
    /// success; a lesser count is a partial delivery, and the
    /// shortfall is handled as a transient failure against the same
    /// task.
    Delivered { plays_delivered: i32 },
    /// A transient failure occurred; the task should be retried.
    Transient { reason: String },
    /// A failure occurred that retrying will not fix (e.g. target
    /// rejected, service discontinued).
    Permanent { reason: String },
    /// The proxy node used for this attempt was banned by the target.
    Banned { reason: String },
}

/// Adapter interface for executing one delivery task against a target
/// through a selected egress node.
///
/// # Object Safety
///
/// This trait is object-safe: every method returns a concrete or boxed
/// type, so it can be stored as `Arc<dyn DispatchClient>` in
/// [`crate::worker::DeliveryWorker`].
#[async_trait]
pub trait DispatchClient: Send + Sync {
    /// Human-readable name for this dispatch integration.
    fn name(&self) -> &str;

    /// Execute one task's delivery work through the given proxy node.
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        node: &ProxyNode,
    ) -> Result<DispatchOutcome>;
}

// Compile-time assertion: DispatchClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn DispatchClient) {}
};

/// A dispatch client that simulates delivery outcomes deterministically,
/// used for tests and local development without a live integration.
pub struct SimulatedDispatchClient {
    /// Outcome returned for every dispatch call.
    pub outcome: DispatchOutcome,
}

impl SimulatedDispatchClient {
    pub fn always(outcome: DispatchOutcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl DispatchClient for SimulatedDispatchClient {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn dispatch(
        &self,
        _request: &DispatchRequest,
        _node: &ProxyNode,
    ) -> Result<DispatchOutcome> {
        Ok(self.outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_db::models::{HealthState, OperationalStatus, ProxyTier};

    fn node() -> ProxyNode {
        ProxyNode {
            id: Uuid::nil(),
            provider: "acme".into(),
            address: "127.0.0.1".into(),
            port: 8080,
            region: None,
            country: None,
            tier: ProxyTier::Datacenter,
            capacity: 10,
            current_load: 0,
            operational_status: OperationalStatus::Online,
            health_state: HealthState::Healthy,
            created_at: Utc::now(),
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            task_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            service_id: "followers".into(),
            target_reference: "https://example.com/post".into(),
            quantity: 400,
            idempotency_token: "order:1:1".into(),
        }
    }

    #[test]
    fn dispatch_client_is_object_safe() {
        let client: Box<dyn DispatchClient> = Box::new(SimulatedDispatchClient::always(
            DispatchOutcome::Delivered { plays_delivered: 400 },
        ));
        assert_eq!(client.name(), "simulated");
    }

    #[tokio::test]
    async fn simulated_client_returns_configured_outcome() {
        let client = SimulatedDispatchClient::always(DispatchOutcome::Transient {
            reason: "rate limited".into(),
        });
        let outcome = client.dispatch(&request(), &node()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Transient { .. }));
    }
}
