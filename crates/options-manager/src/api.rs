//! Typed query/command surface over the running engine.
//!
//! Approvals run inside the position's exclusive section, so a plan is
//! never executed while the expiry sweep or a new proposal touches the
//! same position.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use options_guard_core::AppConfig;
use options_guard_gateway::OptionsFill;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::AlertRequest;
use crate::error::{EngineError, ExecutionError, StalePlanError};
use crate::executor::{ExecutionRecord, PlanKind};
use crate::flight_manual::{self, ExplainInput};
use crate::greeks;
use crate::payoff::{LossBound, PayoffProfile};
use crate::portfolio::{self, AllocationCheck, PortfolioGreeks};
use crate::regime::RegimeState;
use crate::router;
use crate::service::{EngineContext, EngineService};
use crate::types::{
    Account, AlertEvent, AlertSource, EntryPlan, HealthCheckResult, Leg, PlanId, PlanStatus,
    Position, PositionId, PositionStatus, Priority, RepairPlan,
};

/// Result of approving a repair plan.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedRepair {
    pub plan: RepairPlan,
    pub position: Position,
    pub execution: Option<ExecutionRecord>,
    /// True when the plan had already been accepted and nothing was submitted.
    pub replayed: bool,
}

/// Result of submitting an entry plan.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedEntry {
    pub plan: EntryPlan,
    pub position: Position,
    pub execution: Option<ExecutionRecord>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Approval {
    Repair(AcceptedRepair),
    Entry(AcceptedEntry),
}

#[derive(Clone)]
pub struct EngineApi {
    service: Arc<EngineService>,
}

impl EngineApi {
    #[must_use]
    pub fn new(service: Arc<EngineService>) -> Self {
        Self { service }
    }

    fn ctx(&self) -> &Arc<EngineContext> {
        self.service.context()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[must_use]
    pub fn positions(&self, user_id: &str) -> Vec<Position> {
        self.ctx().store.positions(user_id)
    }

    /// # Errors
    ///
    /// `PositionNotFound` for an unknown id.
    pub fn position(&self, id: PositionId) -> Result<Position, EngineError> {
        self.ctx().store.position(id).ok_or(EngineError::PositionNotFound(id))
    }

    #[must_use]
    pub fn pending_plans(&self, user_id: &str) -> Vec<RepairPlan> {
        self.ctx().store.pending_plans(user_id)
    }

    /// # Errors
    ///
    /// `PlanNotFound` for an unknown id.
    pub fn plan(&self, id: PlanId) -> Result<RepairPlan, EngineError> {
        self.ctx().store.plan(id).ok_or(EngineError::PlanNotFound(id))
    }

    /// # Errors
    ///
    /// `PlanNotFound` for an unknown id.
    pub fn entry_plan(&self, id: PlanId) -> Result<EntryPlan, EngineError> {
        self.ctx().store.entry_plan(id).ok_or(EngineError::PlanNotFound(id))
    }

    #[must_use]
    pub fn portfolio_greeks(&self, user_id: &str) -> PortfolioGreeks {
        let multiplier = self.ctx().config().pricing.contract_multiplier;
        portfolio::aggregate(user_id, &self.ctx().store.positions(user_id), multiplier)
    }

    /// Oldest first.
    ///
    /// # Errors
    ///
    /// `PositionNotFound` for an unknown id.
    pub fn health_history(&self, id: PositionId) -> Result<Vec<HealthCheckResult>, EngineError> {
        self.position(id)?;
        Ok(self.ctx().store.health_history(id))
    }

    #[must_use]
    pub fn alert_log(&self, user_id: &str) -> Vec<AlertEvent> {
        self.ctx().alerts.alert_log(user_id)
    }

    #[must_use]
    pub fn regime(&self) -> RegimeState {
        self.ctx().regime()
    }

    #[must_use]
    pub fn subscribe_regime(&self) -> watch::Receiver<RegimeState> {
        self.ctx().subscribe_regime()
    }

    #[must_use]
    pub fn account(&self, user_id: &str) -> Option<Account> {
        self.ctx().store.account(user_id)
    }

    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        self.ctx().config()
    }

    /// Tickers with an active position and the age of their cached chain,
    /// `None` when no chain has been loaded yet.
    #[must_use]
    pub fn chain_ages(&self, now: DateTime<Utc>) -> Vec<(String, Option<i64>)> {
        let store = &self.ctx().store;
        let tickers: BTreeSet<String> = store
            .active_position_ids()
            .into_iter()
            .filter_map(|id| store.position(id))
            .map(|p| p.ticker)
            .collect();
        tickers
            .into_iter()
            .map(|t| {
                let age = self.ctx().chains.get(&t).map(|c| c.age_secs(now));
                (t, age)
            })
            .collect()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn set_account(&self, account: Account) {
        self.ctx().store.set_account(account);
    }

    /// Registers an existing position and queues its first evaluation.
    ///
    /// # Errors
    ///
    /// `Shutdown` when the worker has stopped.
    pub async fn add_position(&self, position: Position) -> Result<PositionId, EngineError> {
        let id = self.ctx().store.add_position(position);
        self.service.enqueue(vec![id]).await?;
        Ok(id)
    }

    /// Evaluates one position now and returns its result.
    ///
    /// # Errors
    ///
    /// `PositionNotFound` for unknown or closed positions, `Shutdown` when
    /// the worker has stopped.
    pub async fn recheck(&self, id: PositionId) -> Result<HealthCheckResult, EngineError> {
        let position = self.position(id)?;
        if !position.status.is_active() {
            return Err(EngineError::PositionNotFound(id));
        }
        self.service
            .evaluate_now(vec![id])
            .await?
            .into_iter()
            .next()
            .ok_or(EngineError::PositionNotFound(id))
    }

    /// Rejects a pending repair or entry plan. Rejected repairs re-arm the
    /// position's monitor.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, or `InvalidTransition` when the plan is not pending.
    pub async fn reject_plan(&self, plan_id: PlanId, reason: Option<String>) -> Result<PlanStatus, EngineError> {
        let now = Utc::now();
        if let Some(plan) = self.ctx().store.plan(plan_id) {
            let lock = self.ctx().store.position_lock(plan.position_id);
            let _guard = lock.lock().await;
            let plan = self.ctx().store.resolve_plan(plan_id, PlanStatus::Rejected, reason, now)?;
            self.audit_plan(&plan).await;
            return Ok(plan.status);
        }

        let lock = self.ctx().store.position_lock(plan_id);
        let _guard = lock.lock().await;
        let plan = self
            .ctx()
            .store
            .resolve_entry_plan(plan_id, PlanStatus::Rejected, reason, None)?;
        self.audit_entry_plan(&plan).await;
        Ok(plan.status)
    }

    /// Approves a plan: repair plans go through [`Self::accept_repair`],
    /// entry plans through [`Self::submit_entry`].
    ///
    /// # Errors
    ///
    /// See the two approval paths.
    pub async fn accept_plan(&self, plan_id: PlanId) -> Result<Approval, EngineError> {
        if self.ctx().store.plan(plan_id).is_some() {
            return self.accept_repair(plan_id).await.map(Approval::Repair);
        }
        if self.ctx().store.entry_plan(plan_id).is_some() {
            return self.submit_entry(plan_id).await.map(Approval::Entry);
        }
        Err(EngineError::PlanNotFound(plan_id))
    }

    /// Re-validates and executes a pending repair plan.
    ///
    /// A second approval of an accepted plan returns the recorded outcome.
    /// A stale plan is expired. A failed execution marks the plan failed,
    /// re-arms the monitor and, for partial fills, raises a critical alert.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `InvalidTransition`, `StalePlan`, `Feed`, or
    /// `Execution` carrying `PartialFill`/`NotFilled`.
    pub async fn accept_repair(&self, plan_id: PlanId) -> Result<AcceptedRepair, EngineError> {
        let ctx = self.ctx();
        let plan = self.plan(plan_id)?;
        let lock = ctx.store.position_lock(plan.position_id);
        let _guard = lock.lock().await;

        let plan = self.plan(plan_id)?;
        match plan.status {
            PlanStatus::Pending => {}
            PlanStatus::Accepted => {
                info!(%plan_id, "Plan already accepted");
                return Ok(AcceptedRepair {
                    position: self.position(plan.position_id)?,
                    execution: ctx.executor.record(&plan.idempotency_key),
                    plan,
                    replayed: true,
                });
            }
            status => {
                return Err(EngineError::InvalidTransition {
                    plan_id,
                    status,
                    action: "accept",
                })
            }
        }

        let position = self.position(plan.position_id)?;
        let config = ctx.config();
        let now = Utc::now();
        if let Err(stale) = self
            .validate_freshness(plan_id, &position.ticker, plan.priced_spot, plan.expires_at, &config, now)
            .await?
        {
            let expired = ctx.store.resolve_plan(plan_id, PlanStatus::Expired, Some(stale.reason.clone()), now)?;
            self.audit_plan(&expired).await;
            return Err(stale.into());
        }

        let record = ctx
            .executor
            .execute(&plan.idempotency_key, plan.id, PlanKind::Repair, &plan.orders(), now)
            .await?;

        let fills = match record.fills() {
            Ok(fills) => fills.to_vec(),
            Err(e) => {
                let failed = ctx
                    .store
                    .resolve_plan(plan_id, PlanStatus::Failed, Some(e.to_string()), Utc::now())?;
                self.audit_plan(&failed).await;
                self.execution_alert(&position.user_id, Some(position.id), &position.ticker, plan_id, &e);
                return Err(e.into());
            }
        };

        let hedge = filled_legs(&plan.hedge_legs, &fills);
        let position = ctx.store.update_position(plan.position_id, |p| {
            p.legs.extend(hedge);
            p.status = PositionStatus::Repaired;
            p.max_loss = plan.new_max_loss;
            p.record_greeks(plan.post_greeks.clone());
        })?;
        let plan = ctx
            .store
            .resolve_plan(plan_id, PlanStatus::Accepted, None, Utc::now())?;
        self.audit_plan(&plan).await;

        info!(
            %plan_id,
            position_id = %position.id,
            legs = position.legs.len(),
            max_loss = %position.max_loss,
            "Repair executed"
        );
        Ok(AcceptedRepair {
            plan,
            position,
            execution: Some(record),
            replayed: false,
        })
    }

    /// Routes, sizes and explains a new position for `user_id` on `ticker`.
    ///
    /// # Errors
    ///
    /// `AccountNotFound`, `Feed` when quotes or chains are unavailable,
    /// `Domain` for unpriceable legs, `NoEntry` when the router, the sizer or
    /// the portfolio limits leave nothing to trade.
    pub async fn recommend_entry(&self, user_id: &str, ticker: &str) -> Result<EntryPlan, EngineError> {
        let ctx = self.ctx();
        let account = ctx
            .store
            .account(user_id)
            .ok_or_else(|| EngineError::AccountNotFound(user_id.to_string()))?;
        let config = ctx.config();
        let now = Utc::now();
        let rate = config.pricing.risk_free_rate;
        let multiplier = config.pricing.contract_multiplier;

        let regime = ctx.regime();
        let rec = router::route(&regime, account.risk_tolerance, account.equity, &config.router);

        let quote = ctx.feed.quote(ticker).await?;
        let chain = ctx
            .chains
            .get_or_refresh(ctx.feed.as_ref(), ticker, config.health.staleness_secs, now)
            .await?;
        let spot = quote.price();
        let spot_f = spot.to_f64().unwrap_or(0.0);

        let legs = router::build_entry_legs(&rec, &chain, spot_f, rate, now)?;
        let unit = greeks::position_greeks(&legs, spot_f, &chain, rate, now)?;
        let profile = PayoffProfile::new(&legs, multiplier);
        let max_loss_unit = profile
            .max_loss()
            .bounded()
            .ok_or_else(|| EngineError::NoEntry(format!("{} has unbounded loss", rec.strategy)))?;

        let days = legs
            .iter()
            .map(|l| l.contract.days_to_expiry(now))
            .min()
            .unwrap_or(0) as f64;
        let volatility = self.forecast_volatility(ticker, &legs, &chain).await;
        let outcome = flight_manual::expected_outcome(&profile, spot_f, volatility, days, rate);

        // no simulated loss: size on the win probability alone
        let payoff_ratio = match outcome.payoff_ratio() {
            r if r.is_finite() => r,
            _ => f64::MAX,
        };
        let decision = config.sizing.sizer().size(
            outcome.win_probability,
            payoff_ratio,
            account.equity,
            max_loss_unit,
        );
        if decision.contracts == 0 {
            return Err(EngineError::NoEntry(format!(
                "{} sized to zero: {}",
                rec.strategy, decision.reason
            )));
        }

        let current = portfolio::aggregate(user_id, &ctx.store.positions(user_id), multiplier);
        let contracts = match portfolio::check_allocation(&current, &unit, decision.contracts, multiplier, &config.health) {
            AllocationCheck::Approved { max_units, .. } => max_units,
            AllocationCheck::Rejected {
                utilization_now,
                utilization_after_one,
            } => {
                return Err(EngineError::NoEntry(format!(
                    "portfolio limits: utilization {utilization_now:.2} would reach {utilization_after_one:.2}"
                )))
            }
        };

        let explanation = flight_manual::explain(&ExplainInput {
            strategy: rec.strategy,
            legs: &legs,
            contracts,
            greeks: &unit,
            spot: spot_f,
            volatility,
            days_to_expiry: days,
            rate,
            regime: &regime,
            multiplier,
        });

        let max_loss = LossBound::Bounded(max_loss_unit * Decimal::from(contracts));
        let equity_fraction = (max_loss_unit * Decimal::from(contracts) / account.equity)
            .to_f64()
            .unwrap_or(0.0);
        let id = Uuid::new_v4();
        let plan = EntryPlan {
            id,
            user_id: user_id.to_string(),
            idempotency_key: format!("entry-{id}"),
            ticker: ticker.to_uppercase(),
            strategy: rec.strategy,
            legs,
            contracts,
            target_delta: unit.delta,
            max_loss,
            equity_fraction,
            explanation,
            priced_spot: spot,
            created_at: now,
            expires_at: now + Duration::seconds(config.repair.plan_ttl_secs),
            status: PlanStatus::Pending,
            status_reason: None,
            position_id: None,
        };

        ctx.store.insert_entry_plan(plan.clone());
        self.audit_entry_plan(&plan).await;
        info!(
            plan_id = %plan.id,
            user_id,
            ticker = plan.ticker,
            strategy = %plan.strategy,
            contracts,
            kelly_contracts = decision.contracts,
            capped = decision.capped,
            "Entry plan proposed"
        );
        Ok(plan)
    }

    /// Executes a pending entry plan and opens the position.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `InvalidTransition`, `StalePlan`, `Feed`, or
    /// `Execution` carrying `PartialFill`/`NotFilled`.
    pub async fn submit_entry(&self, plan_id: PlanId) -> Result<AcceptedEntry, EngineError> {
        let ctx = self.ctx();
        self.entry_plan(plan_id)?;
        let lock = ctx.store.position_lock(plan_id);
        let _guard = lock.lock().await;

        let plan = self.entry_plan(plan_id)?;
        match plan.status {
            PlanStatus::Pending => {}
            PlanStatus::Accepted => {
                let position_id = plan.position_id.ok_or(EngineError::PlanNotFound(plan_id))?;
                info!(%plan_id, "Entry plan already accepted");
                return Ok(AcceptedEntry {
                    position: self.position(position_id)?,
                    execution: ctx.executor.record(&plan.idempotency_key),
                    plan,
                    replayed: true,
                });
            }
            status => {
                return Err(EngineError::InvalidTransition {
                    plan_id,
                    status,
                    action: "submit",
                })
            }
        }

        let config = ctx.config();
        let now = Utc::now();
        if let Err(stale) = self
            .validate_freshness(plan_id, &plan.ticker, plan.priced_spot, plan.expires_at, &config, now)
            .await?
        {
            let expired = ctx
                .store
                .resolve_entry_plan(plan_id, PlanStatus::Expired, Some(stale.reason.clone()), None)?;
            self.audit_entry_plan(&expired).await;
            return Err(stale.into());
        }

        let record = ctx
            .executor
            .execute(&plan.idempotency_key, plan.id, PlanKind::Entry, &plan.orders(), now)
            .await?;

        let fills = match record.fills() {
            Ok(fills) => fills.to_vec(),
            Err(e) => {
                let failed = ctx
                    .store
                    .resolve_entry_plan(plan_id, PlanStatus::Failed, Some(e.to_string()), None)?;
                self.audit_entry_plan(&failed).await;
                self.execution_alert(&plan.user_id, None, &plan.ticker, plan_id, &e);
                return Err(e.into());
            }
        };

        let mut position = Position::new(
            plan.user_id.clone(),
            &plan.ticker,
            plan.strategy,
            filled_legs(&plan.legs, &fills),
            plan.contracts,
            plan.target_delta,
            Utc::now(),
        );
        position.max_loss = plan.max_loss;
        position.equity_fraction = plan.equity_fraction;
        let position_id = ctx.store.add_position(position);

        let plan = ctx
            .store
            .resolve_entry_plan(plan_id, PlanStatus::Accepted, None, Some(position_id))?;
        self.audit_entry_plan(&plan).await;
        info!(%plan_id, %position_id, ticker = plan.ticker, contracts = plan.contracts, "Entry executed");

        if let Err(e) = self.service.enqueue(vec![position_id]).await {
            warn!(%position_id, error = %e, "First evaluation not queued");
        }

        Ok(AcceptedEntry {
            position: self.position(position_id)?,
            plan,
            execution: Some(record),
            replayed: false,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// `Ok(Err(..))` when the plan is stale; the outer error is a feed failure.
    async fn validate_freshness(
        &self,
        plan_id: PlanId,
        ticker: &str,
        priced_spot: Decimal,
        expires_at: DateTime<Utc>,
        config: &AppConfig,
        now: DateTime<Utc>,
    ) -> Result<Result<(), StalePlanError>, EngineError> {
        if now >= expires_at {
            return Ok(Err(StalePlanError {
                plan_id,
                reason: "validity window elapsed".to_string(),
            }));
        }

        let spot = self.ctx().feed.quote(ticker).await?.price();
        if priced_spot > Decimal::ZERO {
            let moved = ((spot - priced_spot) / priced_spot).abs().to_f64().unwrap_or(f64::INFINITY);
            if moved > config.execution.max_underlying_move_pct {
                return Ok(Err(StalePlanError {
                    plan_id,
                    reason: format!(
                        "{ticker} moved {:.2}% since pricing ({priced_spot} -> {spot})",
                        moved * 100.0
                    ),
                }));
            }
        }
        Ok(Ok(()))
    }

    /// Trailing realized volatility of the underlying when the feed has a
    /// window for it, otherwise the mean implied volatility of the legs.
    async fn forecast_volatility(
        &self,
        ticker: &str,
        legs: &[Leg],
        chain: &options_guard_gateway::OptionsChain,
    ) -> f64 {
        if let Ok(window) = self.ctx().feed.signal_window(ticker).await {
            if let Some(rv) = window.bars.last().map(|b| b.realized_vol) {
                if rv.is_finite() && rv > 0.0 {
                    return rv;
                }
            }
        }
        let ivs: Vec<f64> = legs
            .iter()
            .filter_map(|l| chain.find(l.contract.expiry, l.contract.strike, l.contract.right))
            .map(|q| q.iv)
            .collect();
        if ivs.is_empty() {
            return 0.0;
        }
        ivs.iter().sum::<f64>() / ivs.len() as f64
    }

    fn execution_alert(
        &self,
        user_id: &str,
        position_id: Option<PositionId>,
        ticker: &str,
        plan_id: PlanId,
        err: &ExecutionError,
    ) {
        let (priority, headline) = match err {
            ExecutionError::PartialFill(p) if !p.unhedged_legs.is_empty() => (
                Priority::Critical,
                format!("{ticker}: execution partially filled; {} legs may still be open", p.unhedged_legs.len()),
            ),
            ExecutionError::PartialFill(_) => (
                Priority::Critical,
                format!("{ticker}: execution partially filled; filled legs were unwound"),
            ),
            _ => (Priority::Medium, format!("{ticker}: order not filled, nothing changed")),
        };
        self.ctx().alerts.dispatch(
            AlertRequest {
                user_id: user_id.to_string(),
                position_id,
                source: AlertSource::Execution { plan_id },
                priority,
                headline,
                plan_summary: Some(err.to_string()),
            },
            Utc::now(),
        );
    }

    async fn audit_plan(&self, plan: &RepairPlan) {
        if let Some(audit) = &self.ctx().audit {
            if let Err(e) = audit.record_plan(plan).await {
                warn!(plan_id = %plan.id, error = %e, "Failed to audit plan");
            }
        }
    }

    async fn audit_entry_plan(&self, plan: &EntryPlan) {
        if let Some(audit) = &self.ctx().audit {
            if let Err(e) = audit.record_entry_plan(plan).await {
                warn!(plan_id = %plan.id, error = %e, "Failed to audit entry plan");
            }
        }
    }
}

/// Plan legs re-priced at their fill prices.
fn filled_legs(legs: &[Leg], fills: &[OptionsFill]) -> Vec<Leg> {
    legs.iter()
        .zip(fills.iter().map(Some).chain(std::iter::repeat(None)))
        .map(|(leg, fill)| {
            let mut leg = leg.clone();
            if let Some(fill) = fill {
                leg.entry_price = fill.avg_fill_price;
            }
            leg
        })
        .collect()
}
