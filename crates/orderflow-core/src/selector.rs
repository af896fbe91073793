//! Proxy selector.
//!
//! A pure function over a snapshot of candidate nodes: no I/O, no
//! mutation. The worker loop fetches selectable nodes from the registry,
//! then calls [`select_node`] to pick one for a given dispatch attempt.

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use orderflow_db::models::{HealthState, ProxyNode, ProxyTier};

/// A request to bind one node to one task attempt.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub task_id: Uuid,
    pub min_tier: Option<ProxyTier>,
    pub region: Option<String>,
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no available proxy node for task {task_id}")]
    NoAvailableNode { task_id: Uuid },
}

/// Select the best candidate node for a dispatch attempt.
///
/// 1. Filter to nodes that are selectable, meet `min_tier` if set, and
///    match `region` if requested.
/// 2. If any HEALTHY candidate survives, discard DEGRADED candidates —
///    HEALTHY is strictly preferred regardless of load.
/// 3. Sort ascending by `current_load`, tie-broken by node id for
///    deterministic, reproducible selection.
/// 4. An empty result fails with [`SelectorError::NoAvailableNode`].
/// 5. Falling back to a DEGRADED node logs a "degraded-fallback" line
///    tagged with the node and task id.
pub fn select_node<'a>(
    nodes: &'a [ProxyNode],
    request: &SelectionRequest,
) -> Result<&'a ProxyNode, SelectorError> {
    let mut candidates: Vec<&ProxyNode> = nodes
        .iter()
        .filter(|n| n.is_selectable())
        .filter(|n| request.min_tier.is_none_or(|min| n.tier >= min))
        .filter(|n| match &request.region {
            Some(region) => n.region.as_deref() == Some(region.as_str()),
            None => true,
        })
        .collect();

    if candidates.iter().any(|n| n.health_state == HealthState::Healthy) {
        candidates.retain(|n| n.health_state == HealthState::Healthy);
    }

    candidates.sort_by(|a, b| a.current_load.cmp(&b.current_load).then_with(|| a.id.cmp(&b.id)));

    let chosen = candidates
        .into_iter()
        .next()
        .ok_or(SelectorError::NoAvailableNode { task_id: request.task_id })?;

    if chosen.health_state == HealthState::Degraded {
        warn!(
            node_id = %chosen.id,
            task_id = %request.task_id,
            "degraded-fallback"
        );
    }

    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_db::models::OperationalStatus;

    fn node(
        id: u128,
        tier: ProxyTier,
        capacity: i32,
        current_load: i32,
        status: OperationalStatus,
        health: HealthState,
    ) -> ProxyNode {
        node_with_region(id, tier, capacity, current_load, status, health, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn node_with_region(
        id: u128,
        tier: ProxyTier,
        capacity: i32,
        current_load: i32,
        status: OperationalStatus,
        health: HealthState,
        region: Option<&str>,
    ) -> ProxyNode {
        ProxyNode {
            id: Uuid::from_u128(id),
            provider: "acme".into(),
            address: format!("10.0.0.{id}"),
            port: 8080,
            region: region.map(str::to_string),
            country: None,
            tier,
            capacity,
            current_load,
            operational_status: status,
            health_state: health,
            created_at: Utc::now(),
        }
    }

    fn request(task_id: u128) -> SelectionRequest {
        SelectionRequest {
            task_id: Uuid::from_u128(task_id),
            min_tier: None,
            region: None,
        }
    }

    #[test]
    fn picks_least_loaded_selectable_node() {
        let nodes = vec![
            node(1, ProxyTier::Datacenter, 10, 8, OperationalStatus::Online, HealthState::Healthy),
            node(2, ProxyTier::Datacenter, 10, 2, OperationalStatus::Online, HealthState::Healthy),
        ];
        let chosen = select_node(&nodes, &request(99)).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(2));
    }

    #[test]
    fn excludes_offline_and_full_nodes() {
        let nodes = vec![
            node(1, ProxyTier::Datacenter, 10, 10, OperationalStatus::Online, HealthState::Healthy),
            node(2, ProxyTier::Datacenter, 10, 0, OperationalStatus::Online, HealthState::Offline),
            node(3, ProxyTier::Datacenter, 10, 0, OperationalStatus::Banned, HealthState::Healthy),
        ];
        let err = select_node(&nodes, &request(99)).unwrap_err();
        assert!(matches!(err, SelectorError::NoAvailableNode { .. }));
    }

    #[test]
    fn honors_minimum_tier() {
        let nodes = vec![
            node(1, ProxyTier::Datacenter, 10, 0, OperationalStatus::Online, HealthState::Healthy),
            node(2, ProxyTier::Residential, 10, 0, OperationalStatus::Online, HealthState::Healthy),
        ];
        let mut req = request(99);
        req.min_tier = Some(ProxyTier::Isp);
        let chosen = select_node(&nodes, &req).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(2));
    }

    #[test]
    fn honors_region_filter() {
        let nodes = vec![
            node_with_region(1, ProxyTier::Datacenter, 10, 0, OperationalStatus::Online, HealthState::Healthy, Some("eu")),
            node_with_region(2, ProxyTier::Datacenter, 10, 0, OperationalStatus::Online, HealthState::Healthy, Some("us")),
        ];
        let mut req = request(99);
        req.region = Some("us".to_string());
        let chosen = select_node(&nodes, &req).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(2));
    }

    #[test]
    fn healthy_is_strictly_preferred_over_degraded_even_with_less_load() {
        let nodes = vec![
            node(1, ProxyTier::Datacenter, 10, 9, OperationalStatus::Online, HealthState::Healthy),
            node(2, ProxyTier::Datacenter, 10, 1, OperationalStatus::Online, HealthState::Degraded),
        ];
        let chosen = select_node(&nodes, &request(99)).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(1), "healthy must win despite higher load");
    }

    #[test]
    fn falls_back_to_degraded_when_no_healthy_candidate_exists() {
        let nodes = vec![
            node(1, ProxyTier::Datacenter, 10, 5, OperationalStatus::Online, HealthState::Degraded),
            node(2, ProxyTier::Datacenter, 10, 2, OperationalStatus::Online, HealthState::Degraded),
        ];
        let chosen = select_node(&nodes, &request(99)).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(2), "least-loaded degraded node should still win");
    }

    #[test]
    fn ties_break_on_node_id() {
        let nodes = vec![
            node(2, ProxyTier::Mobile, 10, 0, OperationalStatus::Online, HealthState::Healthy),
            node(1, ProxyTier::Datacenter, 10, 0, OperationalStatus::Online, HealthState::Healthy),
        ];
        let chosen = select_node(&nodes, &request(99)).unwrap();
        assert_eq!(chosen.id, Uuid::from_u128(1), "ties break on ascending node id, not tier");
    }

    #[test]
    fn selection_is_stable_across_repeated_calls() {
        let nodes = vec![
            node(3, ProxyTier::Datacenter, 10, 2, OperationalStatus::Online, HealthState::Healthy),
            node(1, ProxyTier::Isp, 10, 2, OperationalStatus::Online, HealthState::Healthy),
        ];
        let first = select_node(&nodes, &request(99)).unwrap().id;
        let second = select_node(&nodes, &request(99)).unwrap().id;
        assert_eq!(first, second);
        assert_eq!(first, Uuid::from_u128(1));
    }
}
