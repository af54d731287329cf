//! Domain types for position health, repair, and alerting.

use chrono::{DateTime, Utc};
use options_guard_gateway::{OptionRight, OptionsContract, OptionsOrder, OrderSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::payoff::LossBound;

pub type PositionId = Uuid;
pub type PlanId = Uuid;

/// Strategy shape of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    LongCall,
    LongPut,
    BullCallSpread,
    BearPutSpread,
    BullPutSpread,
    BearCallSpread,
    IronCondor,
    LongStraddle,
    Custom,
}

impl StrategyType {
    /// Collects premium at entry.
    #[must_use]
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            Self::BullPutSpread | Self::BearCallSpread | Self::IronCondor
        )
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongCall => write!(f, "long call"),
            Self::LongPut => write!(f, "long put"),
            Self::BullCallSpread => write!(f, "bull call spread"),
            Self::BearPutSpread => write!(f, "bear put spread"),
            Self::BullPutSpread => write!(f, "bull put spread"),
            Self::BearCallSpread => write!(f, "bear call spread"),
            Self::IronCondor => write!(f, "iron condor"),
            Self::LongStraddle => write!(f, "long straddle"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// User risk tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskTolerance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk tolerance: {other}")),
        }
    }
}

/// Account facts the engine needs about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub equity: Decimal,
    pub risk_tolerance: RiskTolerance,
}

/// One leg of a structure. `quantity` is signed per structure unit:
/// positive is long, negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub contract: OptionsContract,
    pub quantity: i32,
    pub entry_price: Decimal,
}

impl Leg {
    #[must_use]
    pub fn new(contract: OptionsContract, quantity: i32, entry_price: Decimal) -> Self {
        Self {
            contract,
            quantity,
            entry_price,
        }
    }

    #[must_use]
    pub fn side(&self) -> OrderSide {
        if self.quantity >= 0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    #[must_use]
    pub fn right(&self) -> OptionRight {
        self.contract.right
    }

    /// Limit order for `units` copies of the structure.
    #[must_use]
    pub fn order(&self, units: u32) -> OptionsOrder {
        OptionsOrder::limit(
            self.contract.clone(),
            self.side(),
            self.quantity.unsigned_abs() * units,
            self.entry_price,
        )
    }

    /// Premium received (positive) or paid (negative) per structure unit, per share.
    #[must_use]
    pub fn premium(&self) -> Decimal {
        -Decimal::from(self.quantity) * self.entry_price
    }
}

/// Inputs of one Black-Scholes evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingInputs {
    pub spot: f64,
    pub strike: f64,
    /// Calendar days to expiration.
    pub days_to_expiry: f64,
    /// Annualized implied volatility.
    pub volatility: f64,
    pub rate: f64,
    pub right: OptionRight,
}

/// Immutable Greeks value.
///
/// For a single contract the Greeks are per share. For a position they are
/// the signed sum over legs for one structure unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreeksSnapshot {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per one vol point.
    pub vega: f64,
    /// Per 1% rate move.
    pub rho: f64,
    /// Theoretical value.
    pub price: f64,
    pub computed_at: DateTime<Utc>,
    pub inputs: Vec<PricingInputs>,
}

/// Fixed-length history of Greeks snapshots, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksRing {
    capacity: usize,
    items: VecDeque<GreeksSnapshot>,
}

impl GreeksRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, snapshot: GreeksSnapshot) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(snapshot);
    }

    /// Resizes the ring, dropping the oldest entries if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<&GreeksSnapshot> {
        self.items.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GreeksSnapshot> {
        self.items.iter()
    }

    /// Change in delta from the oldest to the newest snapshot.
    #[must_use]
    pub fn delta_trend(&self) -> Option<f64> {
        match (self.items.front(), self.items.back()) {
            (Some(first), Some(last)) if self.items.len() > 1 => Some(last.delta - first.delta),
            _ => None,
        }
    }
}

impl Default for GreeksRing {
    fn default() -> Self {
        Self::new(5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Repaired,
    Closed,
}

impl PositionStatus {
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Repaired => write!(f, "repaired"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A single option or multi-leg structure held by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: String,
    pub ticker: String,
    pub strategy: StrategyType,
    pub opened_at: DateTime<Utc>,
    pub legs: Vec<Leg>,
    /// Number of structure units held.
    pub contracts: u32,
    /// Per-unit delta the position was built to carry.
    pub target_delta: f64,
    pub greeks: Option<GreeksSnapshot>,
    #[serde(default)]
    pub greeks_history: GreeksRing,
    pub unrealized_pnl: Decimal,
    /// Dollar max loss of the whole position.
    pub max_loss: LossBound,
    pub equity_fraction: f64,
    pub status: PositionStatus,
}

impl Position {
    /// Position with no Greeks yet.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        ticker: &str,
        strategy: StrategyType,
        legs: Vec<Leg>,
        contracts: u32,
        target_delta: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            ticker: ticker.to_uppercase(),
            strategy,
            opened_at,
            legs,
            contracts,
            target_delta,
            greeks: None,
            greeks_history: GreeksRing::default(),
            unrealized_pnl: Decimal::ZERO,
            max_loss: LossBound::Bounded(Decimal::ZERO),
            equity_fraction: 0.0,
            status: PositionStatus::Open,
        }
    }

    /// Records a new snapshot as current and appends it to the history ring.
    pub fn record_greeks(&mut self, snapshot: GreeksSnapshot) {
        self.greeks_history.push(snapshot.clone());
        self.greeks = Some(snapshot);
    }
}

/// Health status, totally ordered `Unchecked < Green < Yellow < Red`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unchecked,
    Green,
    Yellow,
    Red,
}

impl HealthStatus {
    /// Yellow or Red.
    #[must_use]
    pub fn is_breach(self) -> bool {
        matches!(self, Self::Yellow | Self::Red)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchecked => write!(f, "unchecked"),
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Staleness,
    SpreadWidth,
    GreekDrift,
    PortfolioCoherence,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staleness => write!(f, "staleness"),
            Self::SpreadWidth => write!(f, "spread_width"),
            Self::GreekDrift => write!(f, "greek_drift"),
            Self::PortfolioCoherence => write!(f, "portfolio_coherence"),
        }
    }
}

/// Outcome of one of the four health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: HealthStatus,
    pub data_issue: bool,
    /// Measured value (age in seconds, spread fraction, drift, limit utilization).
    pub value: Option<f64>,
    pub detail: String,
}

impl CheckResult {
    #[must_use]
    pub fn pass(kind: CheckKind, value: Option<f64>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: HealthStatus::Green,
            data_issue: false,
            value,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn fail(
        kind: CheckKind,
        status: HealthStatus,
        value: Option<f64>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            data_issue: false,
            value,
            detail: detail.into(),
        }
    }

    /// Red because the inputs could not be trusted.
    #[must_use]
    pub fn data_issue(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: HealthStatus::Red,
            data_issue: true,
            value: None,
            detail: detail.into(),
        }
    }
}

/// Per-position outcome of one monitoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub position_id: PositionId,
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub data_issue: bool,
    /// |current delta - target delta| when Greeks were available.
    pub drift: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Worst failing check, if any.
    #[must_use]
    pub fn worst_check(&self) -> Option<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.status.is_breach())
            .max_by_key(|c| c.status)
    }
}

/// Alert and plan priority, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// One step more urgent, saturating at Critical.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Critical and High go out immediately on every channel.
    #[must_use]
    pub fn is_urgent(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Plan lifecycle: `pending -> accepted | rejected | expired | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Failed,
}

impl PlanStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Terminal states after which the health monitor may propose again.
    #[must_use]
    pub fn rearms_monitor(self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Failed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Proposed corrective trade for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairPlan {
    pub id: PlanId,
    pub position_id: PositionId,
    pub user_id: String,
    pub idempotency_key: String,
    /// Hedge legs, quantities per structure unit of the position.
    pub hedge_legs: Vec<Leg>,
    pub contracts: u32,
    pub pre_delta: f64,
    pub post_greeks: GreeksSnapshot,
    /// Net premium in dollars for the whole hedge; negative is a debit.
    pub net_credit: Decimal,
    pub new_max_loss: LossBound,
    pub priority: Priority,
    pub headline: String,
    pub reason: String,
    /// Underlying price the plan was priced at.
    pub priced_spot: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PlanStatus,
    pub status_reason: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RepairPlan {
    /// Orders for the whole hedge.
    #[must_use]
    pub fn orders(&self) -> Vec<OptionsOrder> {
        self.hedge_legs.iter().map(|l| l.order(self.contracts)).collect()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} (credit ${}, new max loss {})",
            self.headline,
            self.net_credit.round_dp(2),
            self.new_max_loss
        )
    }
}

/// A sized, explained new position awaiting approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPlan {
    pub id: PlanId,
    pub user_id: String,
    pub idempotency_key: String,
    pub ticker: String,
    pub strategy: StrategyType,
    pub legs: Vec<Leg>,
    pub contracts: u32,
    pub target_delta: f64,
    pub max_loss: LossBound,
    pub equity_fraction: f64,
    pub explanation: crate::flight_manual::Explanation,
    pub priced_spot: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PlanStatus,
    pub status_reason: Option<String>,
    /// Position opened when the plan filled.
    #[serde(default)]
    pub position_id: Option<PositionId>,
}

impl EntryPlan {
    #[must_use]
    pub fn orders(&self) -> Vec<OptionsOrder> {
        self.legs.iter().map(|l| l.order(self.contracts)).collect()
    }
}

/// Notification channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Email,
    InApp,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Email => write!(f, "email"),
            Self::InApp => write!(f, "in_app"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    /// Held for the next in-app batch flush.
    Batched,
    Delivered { ack: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// What an alert is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertSource {
    Health { check: CheckKind, status: HealthStatus },
    RepairPlan { plan_id: PlanId },
    NoSafeRepair,
    Execution { plan_id: PlanId },
}

impl AlertSource {
    /// Check-type component of the de-duplication key.
    #[must_use]
    pub fn dedupe_component(&self) -> String {
        match self {
            Self::Health { check, .. } => check.to_string(),
            Self::RepairPlan { plan_id } => format!("repair:{plan_id}"),
            Self::NoSafeRepair => "no_safe_repair".to_string(),
            Self::Execution { plan_id } => format!("execution:{plan_id}"),
        }
    }
}

/// Payload handed to each notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_id: Uuid,
    pub position_id: Option<PositionId>,
    pub user_id: String,
    pub headline: String,
    pub priority: Priority,
    pub plan_summary: Option<String>,
}

/// Dispatch record with per-channel delivery status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub user_id: String,
    pub position_id: Option<PositionId>,
    pub source: AlertSource,
    pub priority: Priority,
    pub headline: String,
    pub plan_summary: Option<String>,
    pub dedupe_key: String,
    pub channels: Vec<ChannelKind>,
    pub deliveries: Vec<DeliveryRecord>,
    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    #[must_use]
    pub fn payload(&self) -> AlertPayload {
        AlertPayload {
            alert_id: self.id,
            position_id: self.position_id,
            user_id: self.user_id.clone(),
            headline: self.headline.clone(),
            priority: self.priority,
            plan_summary: self.plan_summary.clone(),
        }
    }

    #[must_use]
    pub fn delivery(&self, channel: ChannelKind) -> Option<&DeliveryRecord> {
        self.deliveries.iter().find(|d| d.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn snapshot(delta: f64) -> GreeksSnapshot {
        GreeksSnapshot {
            delta,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            rho: 0.0,
            price: 0.0,
            computed_at: Utc::now(),
            inputs: vec![],
        }
    }

    #[test]
    fn health_status_orders_worst_last() {
        let worst = [HealthStatus::Green, HealthStatus::Red, HealthStatus::Yellow]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, HealthStatus::Red);
        assert!(HealthStatus::Unchecked < HealthStatus::Green);
    }

    #[test]
    fn priority_escalation_saturates() {
        assert_eq!(Priority::Low.escalate(), Priority::Medium);
        assert_eq!(Priority::High.escalate(), Priority::Critical);
        assert_eq!(Priority::Critical.escalate(), Priority::Critical);
    }

    #[test]
    fn greeks_ring_keeps_last_n() {
        let mut ring = GreeksRing::new(3);
        for d in [0.1, 0.2, 0.3, 0.4, 0.5] {
            ring.push(snapshot(d));
        }
        assert_eq!(ring.len(), 3);
        assert!((ring.latest().unwrap().delta - 0.5).abs() < f64::EPSILON);
        assert!((ring.delta_trend().unwrap() - 0.2).abs() < 1e-12);

        ring.set_capacity(1);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn leg_orders_scale_by_units() {
        let leg = Leg::new(
            OptionsContract::new(
                "SPY",
                NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
                dec!(440),
                OptionRight::Put,
            ),
            -2,
            dec!(1.10),
        );
        let order = leg.order(3);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 6);
        assert_eq!(leg.premium(), dec!(2.20));
    }

    #[test]
    fn plan_status_rearm() {
        assert!(PlanStatus::Rejected.rearms_monitor());
        assert!(PlanStatus::Failed.rearms_monitor());
        assert!(!PlanStatus::Accepted.rearms_monitor());
        assert!(!PlanStatus::Pending.is_terminal());
    }

    #[test]
    fn risk_tolerance_parses() {
        assert_eq!("HIGH".parse::<RiskTolerance>().unwrap(), RiskTolerance::High);
        assert!("extreme".parse::<RiskTolerance>().is_err());
    }
}
