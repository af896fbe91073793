use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an order.
///
/// Transitions are monotonic along the lifecycle: `Pending -> Running ->
/// {Completed, Partial, Failed} -> Refunded`, with `Cancelled` reachable
/// from `Pending` or `Running`. No backward moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Refunded,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = OrderStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(OrderStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrderStatus`] string.
#[derive(Debug, Clone)]
pub struct OrderStatusParseError(pub String);

impl fmt::Display for OrderStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid order status: {:?}", self.0)
    }
}

impl std::error::Error for OrderStatusParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    FailedRetrying,
    FailedPermanent,
}

impl TaskStatus {
    /// Terminal statuses accept no further mutation of status, executed_at,
    /// or quantity.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::FailedPermanent)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::FailedRetrying => "failed_retrying",
            Self::FailedPermanent => "failed_permanent",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed_retrying" => Ok(Self::FailedRetrying),
            "failed_permanent" => Ok(Self::FailedPermanent),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Outbound egress tier, ordered ascending by cost/quality:
/// `Datacenter < Isp < Tor < Residential < Mobile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProxyTier {
    Datacenter,
    Isp,
    Tor,
    Residential,
    Mobile,
}

impl fmt::Display for ProxyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Datacenter => "datacenter",
            Self::Isp => "isp",
            Self::Tor => "tor",
            Self::Residential => "residential",
            Self::Mobile => "mobile",
        };
        f.write_str(s)
    }
}

impl FromStr for ProxyTier {
    type Err = ProxyTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datacenter" => Ok(Self::Datacenter),
            "isp" => Ok(Self::Isp),
            "tor" => Ok(Self::Tor),
            "residential" => Ok(Self::Residential),
            "mobile" => Ok(Self::Mobile),
            other => Err(ProxyTierParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ProxyTier`] string.
#[derive(Debug, Clone)]
pub struct ProxyTierParseError(pub String);

impl fmt::Display for ProxyTierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid proxy tier: {:?}", self.0)
    }
}

impl std::error::Error for ProxyTierParseError {}

// ---------------------------------------------------------------------------

/// Operational status of a proxy node -- set by administrative action or
/// provider-side signal, orthogonal to the derived [`HealthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    Online,
    Offline,
    Maintenance,
    Banned,
    RateLimited,
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
            Self::Banned => "banned",
            Self::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationalStatus {
    type Err = OperationalStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "maintenance" => Ok(Self::Maintenance),
            "banned" => Ok(Self::Banned),
            "rate_limited" => Ok(Self::RateLimited),
            other => Err(OperationalStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OperationalStatus`] string.
#[derive(Debug, Clone)]
pub struct OperationalStatusParseError(pub String);

impl fmt::Display for OperationalStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operational status: {:?}", self.0)
    }
}

impl std::error::Error for OperationalStatusParseError {}

// ---------------------------------------------------------------------------

/// Derived tri-valued health state of a node.
///
/// `HEALTHY >= 0.85`, `DEGRADED in [0.70, 0.85)`, `OFFLINE < 0.70` success
/// rate. Pure function of success rate; see [`crate::models::HealthState::from_success_rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Offline,
}

impl HealthState {
    /// Band thresholds from the health evaluator contract.
    pub const HEALTHY_THRESHOLD: f64 = 0.85;
    pub const DEGRADED_THRESHOLD: f64 = 0.70;

    /// Pure mapping from a rolling success rate to a health band.
    pub fn from_success_rate(success_rate: f64) -> Self {
        if success_rate >= Self::HEALTHY_THRESHOLD {
            Self::Healthy
        } else if success_rate >= Self::DEGRADED_THRESHOLD {
            Self::Degraded
        } else {
            Self::Offline
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for HealthState {
    type Err = HealthStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "offline" => Ok(Self::Offline),
            other => Err(HealthStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`HealthState`] string.
#[derive(Debug, Clone)]
pub struct HealthStateParseError(pub String);

impl fmt::Display for HealthStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid health state: {:?}", self.0)
    }
}

impl std::error::Error for HealthStateParseError {}

// ---------------------------------------------------------------------------

/// Kind of balance-ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BalanceTxnType {
    Debit,
    Credit,
    Refund,
    Bonus,
    Adjustment,
}

impl fmt::Display for BalanceTxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
            Self::Adjustment => "adjustment",
        };
        f.write_str(s)
    }
}

impl FromStr for BalanceTxnType {
    type Err = BalanceTxnTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            "refund" => Ok(Self::Refund),
            "bonus" => Ok(Self::Bonus),
            "adjustment" => Ok(Self::Adjustment),
            other => Err(BalanceTxnTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BalanceTxnType`] string.
#[derive(Debug, Clone)]
pub struct BalanceTxnTypeParseError(pub String);

impl fmt::Display for BalanceTxnTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid balance transaction type: {:?}", self.0)
    }
}

impl std::error::Error for BalanceTxnTypeParseError {}

// ---------------------------------------------------------------------------

/// Severity of a [`RefundAnomaly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Critical,
}

impl AnomalySeverity {
    /// Classify a discrepancy magnitude per the reconciliation thresholds:
    /// `<= 0.01 -> Info`, `<= 10 -> Warning`, `> 10 -> Critical`.
    pub fn from_delta(delta: Decimal) -> Self {
        let magnitude = delta.abs();
        if magnitude <= Decimal::new(1, 2) {
            Self::Info
        } else if magnitude <= Decimal::from(10) {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for AnomalySeverity {
    type Err = AnomalySeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(AnomalySeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AnomalySeverity`] string.
#[derive(Debug, Clone)]
pub struct AnomalySeverityParseError(pub String);

impl fmt::Display for AnomalySeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid anomaly severity: {:?}", self.0)
    }
}

impl std::error::Error for AnomalySeverityParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A customer order for `quantity` units of a service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_id: String,
    pub quantity: i32,
    pub price_per_unit: Decimal,
    pub target_reference: String,
    pub region: Option<String>,
    pub idempotency_key: Option<String>,
    pub task_based: bool,
    pub status: OrderStatus,
    pub delivered: i32,
    pub remains: i32,
    pub failed_permanent: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An atomic delivery batch belonging to one [`Order`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sequence: i32,
    pub quantity: i32,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub proxy_node_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub retry_after: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub idempotency_token: String,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// An outbound egress endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProxyNode {
    pub id: Uuid,
    pub provider: String,
    pub address: String,
    pub port: i32,
    pub region: Option<String>,
    pub country: Option<String>,
    pub tier: ProxyTier,
    pub capacity: i32,
    pub current_load: i32,
    pub operational_status: OperationalStatus,
    pub health_state: HealthState,
    pub created_at: DateTime<Utc>,
}

impl ProxyNode {
    /// `selectable <=> status = ONLINE AND health != OFFLINE AND
    /// current_load < capacity`.
    pub fn is_selectable(&self) -> bool {
        self.operational_status == OperationalStatus::Online
            && self.health_state != HealthState::Offline
            && self.current_load < self.capacity
    }
}

/// Rolling-window statistics for one [`ProxyNode`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProxyMetrics {
    pub node_id: Uuid,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub success_rate: f64,
    pub ban_count: i64,
    pub ban_rate: f64,
    pub latency_p50_ms: i32,
    pub latency_p95_ms: i32,
    pub latency_p99_ms: i32,
    pub active_connections: i32,
    pub peak_connections: i32,
    pub window_start: DateTime<Utc>,
}

/// Append-only refund ledger entry, at most one per task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefundEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub quantity: i32,
    pub amount: Decimal,
    pub price_per_unit: Decimal,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only user-balance ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub txn_type: BalanceTxnType,
    pub reason: String,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A reconciliation artifact raised when order-level aggregates diverge
/// from ledger aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefundAnomaly {
    pub id: Uuid,
    pub order_id: Uuid,
    pub severity: AnomalySeverity,
    pub description: String,
    pub expected: Option<Decimal>,
    pub actual: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_display_roundtrip() {
        let variants = [
            OrderStatus::Pending,
            OrderStatus::Running,
            OrderStatus::Completed,
            OrderStatus::Partial,
            OrderStatus::Failed,
            OrderStatus::Refunded,
            OrderStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OrderStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn order_status_invalid() {
        assert!("bogus".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Executing,
            TaskStatus::Completed,
            TaskStatus::FailedRetrying,
            TaskStatus::FailedPermanent,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::FailedPermanent.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Executing.is_terminal());
        assert!(!TaskStatus::FailedRetrying.is_terminal());
    }

    #[test]
    fn proxy_tier_ordering() {
        assert!(ProxyTier::Datacenter < ProxyTier::Isp);
        assert!(ProxyTier::Isp < ProxyTier::Tor);
        assert!(ProxyTier::Tor < ProxyTier::Residential);
        assert!(ProxyTier::Residential < ProxyTier::Mobile);
    }

    #[test]
    fn proxy_tier_display_roundtrip() {
        let variants = [
            ProxyTier::Datacenter,
            ProxyTier::Isp,
            ProxyTier::Tor,
            ProxyTier::Residential,
            ProxyTier::Mobile,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ProxyTier = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn health_state_from_success_rate_bands() {
        assert_eq!(HealthState::from_success_rate(1.0), HealthState::Healthy);
        assert_eq!(HealthState::from_success_rate(0.85), HealthState::Healthy);
        assert_eq!(
            HealthState::from_success_rate(0.849_999),
            HealthState::Degraded
        );
        assert_eq!(HealthState::from_success_rate(0.70), HealthState::Degraded);
        assert_eq!(
            HealthState::from_success_rate(0.699_999),
            HealthState::Offline
        );
        assert_eq!(HealthState::from_success_rate(0.0), HealthState::Offline);
    }

    #[test]
    fn health_state_display_roundtrip() {
        let variants = [HealthState::Healthy, HealthState::Degraded, HealthState::Offline];
        for v in &variants {
            let s = v.to_string();
            let parsed: HealthState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn operational_status_display_roundtrip() {
        let variants = [
            OperationalStatus::Online,
            OperationalStatus::Offline,
            OperationalStatus::Maintenance,
            OperationalStatus::Banned,
            OperationalStatus::RateLimited,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OperationalStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn balance_txn_type_display_roundtrip() {
        let variants = [
            BalanceTxnType::Debit,
            BalanceTxnType::Credit,
            BalanceTxnType::Refund,
            BalanceTxnType::Bonus,
            BalanceTxnType::Adjustment,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BalanceTxnType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn anomaly_severity_from_delta_bands() {
        assert_eq!(
            AnomalySeverity::from_delta(Decimal::new(1, 2)),
            AnomalySeverity::Info
        );
        assert_eq!(
            AnomalySeverity::from_delta(Decimal::new(500, 2)),
            AnomalySeverity::Warning
        );
        assert_eq!(
            AnomalySeverity::from_delta(Decimal::from(10)),
            AnomalySeverity::Warning
        );
        assert_eq!(
            AnomalySeverity::from_delta(Decimal::new(1001, 2)),
            AnomalySeverity::Critical
        );
    }

    #[test]
    fn anomaly_severity_display_roundtrip() {
        let variants = [
            AnomalySeverity::Info,
            AnomalySeverity::Warning,
            AnomalySeverity::Critical,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AnomalySeverity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn proxy_node_selectable() {
        let base = ProxyNode {
            id: Uuid::nil(),
            provider: "p".into(),
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
        };
        assert!(base.is_selectable());

        let mut full = base.clone();
        full.current_load = 10;
        assert!(!full.is_selectable());

        let mut offline_health = base.clone();
        offline_health.health_state = HealthState::Offline;
        assert!(!offline_health.is_selectable());

        let mut maintenance = base;
        maintenance.operational_status = OperationalStatus::Maintenance;
        assert!(!maintenance.is_selectable());
    }
}
