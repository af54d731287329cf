//! In-memory portfolio store.
//!
//! Positions live in a flat arena keyed by id. Plans, health history and
//! per-position debounce state sit next to them under one lock; callers
//! that read-modify-write a position across an await take the position's
//! exclusive section from [`PortfolioStore::position_lock`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use options_guard_core::HealthConfig;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::health::MonitorState;
use crate::types::{
    Account, EntryPlan, GreeksSnapshot, HealthCheckResult, HealthStatus, PlanId, PlanStatus,
    Position, PositionId, RepairPlan,
};

#[derive(Debug, Default)]
struct StoreInner {
    positions: HashMap<PositionId, Position>,
    accounts: HashMap<String, Account>,
    plans: HashMap<PlanId, RepairPlan>,
    pending: HashMap<PositionId, PlanId>,
    entries: HashMap<PlanId, EntryPlan>,
    health: HashMap<PositionId, VecDeque<HealthCheckResult>>,
    monitors: HashMap<PositionId, MonitorState>,
    health_history_len: usize,
    greeks_history_len: usize,
}

impl StoreInner {
    fn resolve(
        &mut self,
        plan_id: PlanId,
        status: PlanStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RepairPlan, EngineError> {
        let plan = self
            .plans
            .get_mut(&plan_id)
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        if plan.status != PlanStatus::Pending {
            return Err(EngineError::InvalidTransition {
                plan_id,
                status: plan.status,
                action: "resolve",
            });
        }
        plan.status = status;
        plan.status_reason = reason;
        plan.resolved_at = Some(now);
        let plan = plan.clone();

        if self.pending.get(&plan.position_id) == Some(&plan_id) {
            self.pending.remove(&plan.position_id);
        }
        if status.rearms_monitor() {
            self.monitors.entry(plan.position_id).or_default().rearm();
        }
        Ok(plan)
    }
}

#[derive(Debug)]
pub struct PortfolioStore {
    inner: RwLock<StoreInner>,
    locks: Mutex<HashMap<PositionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for PortfolioStore {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}

impl PortfolioStore {
    #[must_use]
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                health_history_len: config.health_history_len.max(1),
                greeks_history_len: config.greeks_history_len.max(1),
                ..StoreInner::default()
            }),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Applies new retention limits to every position.
    pub fn set_limits(&self, config: &HealthConfig) {
        let mut inner = self.inner.write();
        if inner.greeks_history_len != config.greeks_history_len.max(1) {
            inner.greeks_history_len = config.greeks_history_len.max(1);
            let len = inner.greeks_history_len;
            for p in inner.positions.values_mut() {
                p.greeks_history.set_capacity(len);
            }
        }
        inner.health_history_len = config.health_history_len.max(1);
        let len = inner.health_history_len;
        for history in inner.health.values_mut() {
            while history.len() > len {
                history.pop_front();
            }
        }
    }

    /// Exclusive section for one position.
    #[must_use]
    pub fn position_lock(&self, id: PositionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub fn set_account(&self, account: Account) {
        info!(user_id = account.user_id, equity = %account.equity, tolerance = %account.risk_tolerance, "Account updated");
        self.inner.write().accounts.insert(account.user_id.clone(), account);
    }

    #[must_use]
    pub fn account(&self, user_id: &str) -> Option<Account> {
        self.inner.read().accounts.get(user_id).cloned()
    }

    // =========================================================================
    // Positions
    // =========================================================================

    pub fn add_position(&self, mut position: Position) -> PositionId {
        let mut inner = self.inner.write();
        position.greeks_history.set_capacity(inner.greeks_history_len);
        let id = position.id;
        info!(
            position_id = %id,
            user_id = position.user_id,
            ticker = position.ticker,
            strategy = %position.strategy,
            contracts = position.contracts,
            "Position added"
        );
        inner.positions.insert(id, position);
        inner.monitors.entry(id).or_default();
        id
    }

    #[must_use]
    pub fn position(&self, id: PositionId) -> Option<Position> {
        self.inner.read().positions.get(&id).cloned()
    }

    /// A user's positions, oldest first.
    #[must_use]
    pub fn positions(&self, user_id: &str) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .inner
            .read()
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.opened_at, p.id));
        out
    }

    #[must_use]
    pub fn active_position_ids(&self) -> Vec<PositionId> {
        let mut ids: Vec<(DateTime<Utc>, PositionId)> = self
            .inner
            .read()
            .positions
            .values()
            .filter(|p| p.status.is_active())
            .map(|p| (p.opened_at, p.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Applies `f` to a position and returns the updated copy.
    ///
    /// # Errors
    ///
    /// `PositionNotFound` for an unknown id.
    pub fn update_position(
        &self,
        id: PositionId,
        f: impl FnOnce(&mut Position),
    ) -> Result<Position, EngineError> {
        let mut inner = self.inner.write();
        let position = inner
            .positions
            .get_mut(&id)
            .ok_or(EngineError::PositionNotFound(id))?;
        f(position);
        Ok(position.clone())
    }

    pub fn record_greeks(&self, id: PositionId, snapshot: GreeksSnapshot) {
        if let Some(p) = self.inner.write().positions.get_mut(&id) {
            p.record_greeks(snapshot);
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub fn record_health(&self, result: HealthCheckResult) {
        let mut inner = self.inner.write();
        let len = inner.health_history_len;
        let history = inner.health.entry(result.position_id).or_default();
        while history.len() >= len {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Health results for a position, oldest first.
    #[must_use]
    pub fn health_history(&self, id: PositionId) -> Vec<HealthCheckResult> {
        self.inner
            .read()
            .health
            .get(&id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn latest_health(&self, id: PositionId) -> Option<HealthCheckResult> {
        self.inner.read().health.get(&id).and_then(|h| h.back().cloned())
    }

    /// Feeds a status to the position's debounce state; true means trigger.
    pub fn observe(&self, id: PositionId, status: HealthStatus) -> bool {
        self.inner.write().monitors.entry(id).or_default().observe(status)
    }

    #[must_use]
    pub fn monitor_state(&self, id: PositionId) -> MonitorState {
        self.inner.read().monitors.get(&id).copied().unwrap_or_default()
    }

    // =========================================================================
    // Repair plans
    // =========================================================================

    /// Stores a new pending plan. A plan still pending for the same position
    /// is expired as superseded and returned.
    pub fn insert_plan(&self, plan: RepairPlan) -> Option<RepairPlan> {
        let mut inner = self.inner.write();
        let superseded = match inner.pending.get(&plan.position_id).copied() {
            Some(old) => inner
                .resolve(
                    old,
                    PlanStatus::Expired,
                    Some(format!("superseded by {}", plan.id)),
                    plan.created_at,
                )
                .ok(),
            None => None,
        };
        // superseded plans do not re-arm
        if let Some(m) = inner.monitors.get_mut(&plan.position_id) {
            m.rearmed = false;
        }
        debug!(plan_id = %plan.id, position_id = %plan.position_id, priority = %plan.priority, "Plan stored");
        inner.pending.insert(plan.position_id, plan.id);
        inner.plans.insert(plan.id, plan);
        superseded
    }

    #[must_use]
    pub fn plan(&self, id: PlanId) -> Option<RepairPlan> {
        self.inner.read().plans.get(&id).cloned()
    }

    #[must_use]
    pub fn pending_plan_for(&self, position_id: PositionId) -> Option<RepairPlan> {
        let inner = self.inner.read();
        inner
            .pending
            .get(&position_id)
            .and_then(|id| inner.plans.get(id))
            .cloned()
    }

    /// A user's pending plans, most urgent first.
    #[must_use]
    pub fn pending_plans(&self, user_id: &str) -> Vec<RepairPlan> {
        let inner = self.inner.read();
        let mut plans: Vec<RepairPlan> = inner
            .pending
            .values()
            .filter_map(|id| inner.plans.get(id))
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        plans
    }

    /// Moves a pending plan to a terminal status. Rejected, expired and
    /// failed plans re-arm the position's monitor.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, or `InvalidTransition` when the plan is not pending.
    pub fn resolve_plan(
        &self,
        plan_id: PlanId,
        status: PlanStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RepairPlan, EngineError> {
        let plan = self.inner.write().resolve(plan_id, status, reason, now)?;
        info!(%plan_id, position_id = %plan.position_id, %status, "Plan resolved");
        Ok(plan)
    }

    /// Expires the pending plan of a position that recovered.
    pub fn expire_pending_for(
        &self,
        position_id: PositionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<RepairPlan> {
        let mut inner = self.inner.write();
        let plan_id = inner.pending.get(&position_id).copied()?;
        let plan = inner
            .resolve(plan_id, PlanStatus::Expired, Some(reason.to_string()), now)
            .ok()?;
        if let Some(m) = inner.monitors.get_mut(&position_id) {
            m.rearmed = false;
        }
        Some(plan)
    }

    // =========================================================================
    // Entry plans
    // =========================================================================

    pub fn insert_entry_plan(&self, plan: EntryPlan) {
        debug!(plan_id = %plan.id, user_id = plan.user_id, ticker = plan.ticker, "Entry plan stored");
        self.inner.write().entries.insert(plan.id, plan);
    }

    #[must_use]
    pub fn entry_plan(&self, id: PlanId) -> Option<EntryPlan> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// # Errors
    ///
    /// `PlanNotFound`, or `InvalidTransition` when the plan is not pending.
    pub fn resolve_entry_plan(
        &self,
        plan_id: PlanId,
        status: PlanStatus,
        reason: Option<String>,
        position_id: Option<PositionId>,
    ) -> Result<EntryPlan, EngineError> {
        let mut inner = self.inner.write();
        let plan = inner
            .entries
            .get_mut(&plan_id)
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        if plan.status != PlanStatus::Pending {
            return Err(EngineError::InvalidTransition {
                plan_id,
                status: plan.status,
                action: "resolve",
            });
        }
        plan.status = status;
        plan.status_reason = reason;
        plan.position_id = position_id;
        info!(%plan_id, %status, "Entry plan resolved");
        Ok(plan.clone())
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Expires pending plans past their deadline. Plans whose position is
    /// inside an exclusive section (being approved) are left for the next sweep.
    pub fn expire_due(&self, now: DateTime<Utc>) -> (Vec<RepairPlan>, Vec<EntryPlan>) {
        let due: Vec<(PositionId, PlanId)> = {
            let inner = self.inner.read();
            inner
                .pending
                .iter()
                .filter(|(_, id)| inner.plans.get(id).is_some_and(|p| p.expires_at <= now))
                .map(|(pos, id)| (*pos, *id))
                .collect()
        };

        let mut repairs = Vec::with_capacity(due.len());
        for (position_id, plan_id) in due {
            let lock = self.position_lock(position_id);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            if let Ok(plan) = self.inner.write().resolve(
                plan_id,
                PlanStatus::Expired,
                Some("validity window elapsed".to_string()),
                now,
            ) {
                repairs.push(plan);
            }
        }

        let due_entries: Vec<PlanId> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|p| p.status == PlanStatus::Pending && p.expires_at <= now)
            .map(|p| p.id)
            .collect();

        // entry plans are locked under their own id while being submitted
        let mut entries = Vec::with_capacity(due_entries.len());
        for plan_id in due_entries {
            let lock = self.position_lock(plan_id);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            if let Some(plan) = self.inner.write().entries.get_mut(&plan_id) {
                if plan.status == PlanStatus::Pending {
                    plan.status = PlanStatus::Expired;
                    plan.status_reason = Some("validity window elapsed".to_string());
                    entries.push(plan.clone());
                }
            }
        }

        if !repairs.is_empty() || !entries.is_empty() {
            info!(repairs = repairs.len(), entries = entries.len(), "Expired plans");
        }
        self.prune_idle_locks();
        (repairs, entries)
    }

    /// Drops exclusive-section locks nobody holds or waits on. Runs with every
    /// sweep so resolved entry plans and closed positions do not accumulate.
    pub fn prune_idle_locks(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payoff::LossBound;
    use crate::test_support::now;
    use crate::types::{PositionStatus, Priority, StrategyType};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    // =========================================================================
    // Helpers
    // =========================================================================

    fn position(user: &str) -> Position {
        Position::new(user, "SPY", StrategyType::Custom, vec![], 1, 0.1, now())
    }

    fn plan(position_id: PositionId, priority: Priority) -> RepairPlan {
        let id = Uuid::new_v4();
        RepairPlan {
            id,
            position_id,
            user_id: "u1".to_string(),
            idempotency_key: format!("repair-{id}"),
            hedge_legs: vec![],
            contracts: 1,
            pre_delta: 0.35,
            post_greeks: GreeksSnapshot {
                delta: 0.08,
                gamma: 0.0,
                theta: 0.0,
                vega: 0.0,
                rho: 0.0,
                price: 0.0,
                computed_at: now(),
                inputs: vec![],
            },
            net_credit: dec!(12),
            new_max_loss: LossBound::Bounded(dec!(400)),
            priority,
            headline: "SPY".to_string(),
            reason: String::new(),
            priced_spot: Decimal::from(100),
            created_at: now(),
            expires_at: now() + Duration::minutes(15),
            status: PlanStatus::Pending,
            status_reason: None,
            resolved_at: None,
        }
    }

    // =========================================================================
    // Positions and health
    // =========================================================================

    #[test]
    fn positions_are_scoped_by_user() {
        let store = PortfolioStore::default();
        store.add_position(position("u1"));
        store.add_position(position("u2"));
        let closed = store.add_position(position("u1"));
        store
            .update_position(closed, |p| p.status = PositionStatus::Closed)
            .unwrap();

        assert_eq!(store.positions("u1").len(), 2);
        assert_eq!(store.active_position_ids().len(), 2);
        assert!(matches!(
            store.update_position(Uuid::new_v4(), |_| {}),
            Err(EngineError::PositionNotFound(_))
        ));
    }

    #[test]
    fn health_history_is_bounded() {
        let config = HealthConfig {
            health_history_len: 3,
            ..HealthConfig::default()
        };
        let store = PortfolioStore::new(&config);
        let id = store.add_position(position("u1"));
        for i in 0..5 {
            store.record_health(HealthCheckResult {
                position_id: id,
                status: HealthStatus::Green,
                checks: vec![],
                data_issue: false,
                drift: Some(f64::from(i)),
                checked_at: now() + Duration::seconds(i64::from(i)),
            });
        }
        let history = store.health_history(id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].drift, Some(2.0));
        assert_eq!(store.latest_health(id).unwrap().drift, Some(4.0));
    }

    // =========================================================================
    // Plans
    // =========================================================================

    #[test]
    fn one_pending_plan_per_position() {
        let store = PortfolioStore::default();
        let id = store.add_position(position("u1"));
        let first = plan(id, Priority::Medium);
        let first_id = first.id;
        assert!(store.insert_plan(first).is_none());

        let second = plan(id, Priority::High);
        let superseded = store.insert_plan(second.clone()).unwrap();
        assert_eq!(superseded.id, first_id);
        assert_eq!(superseded.status, PlanStatus::Expired);

        let pending = store.pending_plans("u1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }

    #[test]
    fn rejection_rearms_monitor_and_blocks_second_resolve() {
        let store = PortfolioStore::default();
        let id = store.add_position(position("u1"));
        assert!(store.observe(id, HealthStatus::Red));
        let p = plan(id, Priority::High);
        store.insert_plan(p.clone());

        assert!(!store.observe(id, HealthStatus::Red));
        store
            .resolve_plan(p.id, PlanStatus::Rejected, Some("no".into()), now())
            .unwrap();
        assert!(store.monitor_state(id).rearmed);
        assert!(store.observe(id, HealthStatus::Red));

        let err = store
            .resolve_plan(p.id, PlanStatus::Accepted, None, now())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn recovery_expires_pending_without_rearming() {
        let store = PortfolioStore::default();
        let id = store.add_position(position("u1"));
        store.insert_plan(plan(id, Priority::Medium));

        let expired = store.expire_pending_for(id, "recovered", now()).unwrap();
        assert_eq!(expired.status, PlanStatus::Expired);
        assert!(store.pending_plan_for(id).is_none());
        assert!(!store.monitor_state(id).rearmed);
    }

    #[tokio::test]
    async fn sweep_skips_positions_being_approved() {
        let store = PortfolioStore::default();
        let busy = store.add_position(position("u1"));
        let idle = store.add_position(position("u1"));
        store.insert_plan(plan(busy, Priority::High));
        store.insert_plan(plan(idle, Priority::High));

        let lock = store.position_lock(busy);
        let guard = lock.lock().await;
        let (expired, _) = store.expire_due(now() + Duration::minutes(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].position_id, idle);
        drop(guard);

        let (expired, _) = store.expire_due(now() + Duration::minutes(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].position_id, busy);
        assert!(store.monitor_state(busy).rearmed);
    }

    #[tokio::test]
    async fn sweep_drops_idle_locks() {
        let store = PortfolioStore::default();
        for _ in 0..5 {
            let lock = store.position_lock(Uuid::new_v4());
            let _guard = lock.lock().await;
        }
        let held_id = Uuid::new_v4();
        let held = store.position_lock(held_id);

        store.expire_due(now());
        assert_eq!(store.locks.lock().len(), 1);
        assert!(Arc::ptr_eq(&held, &store.position_lock(held_id)));

        drop(held);
        assert_eq!(store.prune_idle_locks(), 1);
        assert!(store.locks.lock().is_empty());
    }
}
