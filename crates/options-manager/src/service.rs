//! Background service: evaluation worker and interval tasks.
//!
//! Every "evaluate these positions now" request (scheduled health passes
//! and on-demand re-checks alike) becomes an [`EvaluationJob`] on one mpsc
//! queue, consumed by a single worker. The regime detector, health pass,
//! plan-expiry sweep and alert flush each run on their own interval.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use options_guard_core::AppConfig;
use options_guard_gateway::{BrokerGateway, MarketDataFeed, OptionsChain, StockQuote};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertDispatcher, AlertRequest, NotificationChannel};
use crate::chain_cache::ChainCache;
use crate::error::EngineError;
use crate::executor::ExecutionOrchestrator;
use crate::health;
use crate::persistence::AuditSink;
use crate::portfolio;
use crate::regime::{RegimeDetector, RegimeState};
use crate::repair::{self, RepairOutcome, RepairRequest};
use crate::store::PortfolioStore;
use crate::types::{
    AlertSource, CheckKind, CheckResult, HealthCheckResult, HealthStatus, Position, PositionId,
    Priority, RepairPlan,
};

/// Positions to evaluate, with an optional reply for on-demand callers.
#[derive(Debug)]
pub struct EvaluationJob {
    pub positions: Vec<PositionId>,
    pub reply: Option<oneshot::Sender<Vec<HealthCheckResult>>>,
}

#[derive(Debug, Clone, Default)]
struct MarketView {
    quote: Option<StockQuote>,
    chain: Option<Arc<OptionsChain>>,
}

/// Shared engine state and collaborators.
pub struct EngineContext {
    pub store: Arc<PortfolioStore>,
    pub feed: Arc<dyn MarketDataFeed>,
    pub chains: ChainCache,
    pub alerts: AlertDispatcher,
    pub executor: ExecutionOrchestrator,
    pub audit: Option<Arc<dyn AuditSink>>,
    config: watch::Receiver<AppConfig>,
    regime: watch::Sender<RegimeState>,
    detector: Mutex<RegimeDetector>,
}

impl EngineContext {
    #[must_use]
    pub fn new(
        config: watch::Receiver<AppConfig>,
        feed: Arc<dyn MarketDataFeed>,
        broker: Arc<dyn BrokerGateway>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let initial = config.borrow().clone();
        let mut alerts = AlertDispatcher::new(channels, initial.alerts.clone());
        let mut executor = ExecutionOrchestrator::new(
            broker,
            Duration::from_millis(initial.execution.leg_timeout_ms),
        );
        if let Some(audit) = &audit {
            alerts = alerts.with_audit(Arc::clone(audit));
            executor = executor.with_audit(Arc::clone(audit));
        }
        let (regime, _) = watch::channel(RegimeState::initial(Utc::now()));

        Self {
            store: Arc::new(PortfolioStore::new(&initial.health)),
            feed,
            chains: ChainCache::new(),
            alerts,
            executor,
            audit,
            config,
            regime,
            detector: Mutex::new(RegimeDetector::new()),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        Arc::new(self.config.borrow().clone())
    }

    /// Pushes reloadable settings into the components that cache them.
    pub fn apply_config(&self, config: &AppConfig) {
        self.alerts.update_config(config.alerts.clone());
        self.executor
            .set_leg_timeout(Duration::from_millis(config.execution.leg_timeout_ms));
        self.store.set_limits(&config.health);
    }

    #[must_use]
    pub fn regime(&self) -> RegimeState {
        self.regime.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_regime(&self) -> watch::Receiver<RegimeState> {
        self.regime.subscribe()
    }

    /// Reclassifies the market from the benchmark's signal window. A feed
    /// failure keeps the previous regime.
    pub async fn refresh_regime(&self, now: DateTime<Utc>) -> RegimeState {
        let config = self.config();
        let window = match self.feed.signal_window(&config.regime.benchmark).await {
            Ok(w) => w,
            Err(e) => {
                warn!(benchmark = config.regime.benchmark, error = %e, "Signal window unavailable");
                return self.regime();
            }
        };
        let state = self.detector.lock().evaluate(&window, now, &config.regime);
        if state.is_shift {
            info!(regime = %state.regime, confidence = state.confidence, "Active regime changed");
        }
        self.regime.send_replace(state.clone());
        state
    }

    async fn audit_plan(&self, plan: &RepairPlan) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_plan(plan).await {
                warn!(plan_id = %plan.id, error = %e, "Failed to audit plan");
            }
        }
    }

    async fn audit_health(&self, result: &HealthCheckResult) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_health(result).await {
                warn!(position_id = %result.position_id, error = %e, "Failed to audit health result");
            }
        }
    }

    async fn load_market(
        &self,
        tickers: &BTreeSet<String>,
        config: &AppConfig,
        now: DateTime<Utc>,
    ) -> HashMap<String, MarketView> {
        let mut market = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            let quote = match self.feed.quote(ticker).await {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!(ticker, error = %e, "Quote unavailable");
                    None
                }
            };
            let chain = match self
                .chains
                .get_or_refresh(self.feed.as_ref(), ticker, config.health.staleness_secs, now)
                .await
            {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(ticker, error = %e, "Option chain unavailable");
                    self.chains.get(ticker)
                }
            };
            market.insert(ticker.clone(), MarketView { quote, chain });
        }
        market
    }

    /// One health pass over `ids`. Errors in one position only affect that
    /// position's result.
    pub async fn evaluate(&self, ids: &[PositionId], now: DateTime<Utc>) -> Vec<HealthCheckResult> {
        let config = self.config();
        let positions: Vec<Position> = ids
            .iter()
            .filter_map(|id| self.store.position(*id))
            .filter(|p| p.status.is_active())
            .collect();
        if positions.is_empty() {
            return Vec::new();
        }

        let tickers: BTreeSet<String> = positions.iter().map(|p| p.ticker.clone()).collect();
        let market = self.load_market(&tickers, &config, now).await;
        let multiplier = config.pricing.contract_multiplier;

        // local checks; snapshots and marks land in the store before coherence
        let mut assessed = Vec::with_capacity(positions.len());
        for position in &positions {
            let view = market.get(&position.ticker).cloned().unwrap_or_default();
            let assessment = health::assess(
                position,
                view.quote.as_ref(),
                view.chain.as_deref(),
                config.pricing.risk_free_rate,
                now,
                &config.health,
            );
            let pnl = view
                .chain
                .as_deref()
                .and_then(|c| portfolio::unrealized_pnl(position, c, multiplier));
            let snapshot = assessment.snapshot.clone();
            if let Err(e) = self.store.update_position(position.id, |p| {
                if let Some(s) = snapshot {
                    p.record_greeks(s);
                }
                if let Some(pnl) = pnl {
                    p.unrealized_pnl = pnl;
                }
            }) {
                warn!(position_id = %position.id, error = %e, "Position vanished during pass");
            }
            assessed.push(assessment);
        }

        let users: BTreeSet<&str> = positions.iter().map(|p| p.user_id.as_str()).collect();
        let coherence: HashMap<&str, CheckResult> = users
            .into_iter()
            .map(|user| {
                let greeks = portfolio::aggregate(user, &self.store.positions(user), multiplier);
                (user, portfolio::coherence_check(&greeks, &config.health))
            })
            .collect();

        let mut results = Vec::with_capacity(positions.len());
        let mut requests = Vec::new();
        let mut legs_at_request: HashMap<PositionId, usize> = HashMap::new();

        for (position, assessment) in positions.iter().zip(assessed) {
            let snapshot = assessment.snapshot.clone();
            let check = coherence
                .get(position.user_id.as_str())
                .cloned()
                .unwrap_or_else(|| CheckResult::pass(CheckKind::PortfolioCoherence, None, "no exposure"));
            let result = health::finalize(position.id, assessment, check, now);

            self.store.record_health(result.clone());
            self.audit_health(&result).await;

            if result.status == HealthStatus::Green {
                if let Some(plan) = self.store.expire_pending_for(position.id, "position recovered", now) {
                    info!(plan_id = %plan.id, position_id = %position.id, "Pending plan expired on recovery");
                    self.audit_plan(&plan).await;
                }
            }

            if self.store.observe(position.id, result.status) {
                let view = market.get(&position.ticker).cloned().unwrap_or_default();
                match repair_inputs(&result, snapshot, &view) {
                    Some((snapshot, drift, chain, spot)) => {
                        let current = self.store.position(position.id).unwrap_or_else(|| position.clone());
                        let equity = self
                            .store
                            .account(&position.user_id)
                            .map_or(Decimal::ZERO, |a| a.equity);
                        legs_at_request.insert(position.id, current.legs.len());
                        requests.push(RepairRequest {
                            position: current,
                            snapshot,
                            chain,
                            spot,
                            status: result.status,
                            drift,
                            equity,
                            now,
                        });
                    }
                    None => self.health_alert(position, &result, now),
                }
            }
            results.push(result);
        }

        if !requests.is_empty() {
            debug!(count = requests.len(), "Searching repairs");
            for (position_id, outcome) in repair::evaluate_batch(requests, Arc::clone(&config)).await {
                let Some(position) = positions.iter().find(|p| p.id == position_id) else {
                    continue;
                };
                match outcome {
                    Ok(RepairOutcome::Plan(plan)) => {
                        let legs = legs_at_request.get(&position_id).copied().unwrap_or_default();
                        self.propose(*plan, legs, now).await;
                    }
                    Ok(RepairOutcome::NoSafeRepair { priority, reason, .. }) => {
                        self.alerts.dispatch(
                            AlertRequest {
                                user_id: position.user_id.clone(),
                                position_id: Some(position_id),
                                source: AlertSource::NoSafeRepair,
                                priority,
                                headline: format!(
                                    "{}: out of tolerance, monitoring (no safe repair available yet)",
                                    position.ticker
                                ),
                                plan_summary: Some(reason),
                            },
                            now,
                        );
                    }
                    Err(e) => {
                        error!(%position_id, error = %e, "Repair search failed");
                        if let Some(result) = results.iter().find(|r| r.position_id == position_id) {
                            self.health_alert(position, result, now);
                        }
                    }
                }
            }
        }

        info!(
            positions = results.len(),
            red = results.iter().filter(|r| r.status == HealthStatus::Red).count(),
            yellow = results.iter().filter(|r| r.status == HealthStatus::Yellow).count(),
            "Health pass complete"
        );
        results
    }

    /// Stores a fresh plan unless the position changed shape while it was being priced.
    async fn propose(&self, plan: RepairPlan, legs_at_request: usize, now: DateTime<Utc>) {
        let lock = self.store.position_lock(plan.position_id);
        let _guard = lock.lock().await;

        let current = self.store.position(plan.position_id);
        if current.as_ref().map(|p| (p.legs.len(), p.status.is_active())) != Some((legs_at_request, true)) {
            info!(plan_id = %plan.id, position_id = %plan.position_id, "Dropping plan priced against an outdated position");
            return;
        }

        if let Some(old) = self.store.insert_plan(plan.clone()) {
            self.audit_plan(&old).await;
        }
        self.audit_plan(&plan).await;

        info!(
            plan_id = %plan.id,
            position_id = %plan.position_id,
            priority = %plan.priority,
            credit = %plan.net_credit,
            headline = plan.headline,
            "Repair plan proposed"
        );
        self.alerts.dispatch(
            AlertRequest {
                user_id: plan.user_id.clone(),
                position_id: Some(plan.position_id),
                source: AlertSource::RepairPlan { plan_id: plan.id },
                priority: plan.priority,
                headline: plan.headline.clone(),
                plan_summary: Some(plan.summary()),
            },
            now,
        );
    }

    fn health_alert(&self, position: &Position, result: &HealthCheckResult, now: DateTime<Utc>) {
        let Some(worst) = result.worst_check() else {
            return;
        };
        let priority = if result.status == HealthStatus::Red {
            Priority::High
        } else {
            Priority::Medium
        };
        self.alerts.dispatch(
            AlertRequest {
                user_id: position.user_id.clone(),
                position_id: Some(position.id),
                source: AlertSource::Health {
                    check: worst.kind,
                    status: result.status,
                },
                priority,
                headline: format!("{}: {} ({})", position.ticker, result.status, worst.detail),
                plan_summary: None,
            },
            now,
        );
    }

    /// Expires plans past their validity window.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let (repairs, entries) = self.store.expire_due(now);
        for plan in &repairs {
            self.audit_plan(plan).await;
        }
        if let Some(audit) = &self.audit {
            for plan in &entries {
                if let Err(e) = audit.record_entry_plan(plan).await {
                    warn!(plan_id = %plan.id, error = %e, "Failed to audit entry plan");
                }
            }
        }
        repairs.len() + entries.len()
    }
}

/// Drift-driven breaches with a snapshot and market data go to the repair
/// engine; any other breach is alert-only.
fn repair_inputs(
    result: &HealthCheckResult,
    snapshot: Option<crate::types::GreeksSnapshot>,
    view: &MarketView,
) -> Option<(crate::types::GreeksSnapshot, f64, Arc<OptionsChain>, Decimal)> {
    let drift_breach = result
        .checks
        .iter()
        .any(|c| c.kind == CheckKind::GreekDrift && c.status.is_breach() && !c.data_issue);
    if !drift_breach {
        return None;
    }
    Some((
        snapshot?,
        result.drift?,
        Arc::clone(view.chain.as_ref()?),
        view.quote.as_ref()?.price(),
    ))
}

async fn run_worker(ctx: Arc<EngineContext>, mut rx: mpsc::Receiver<EvaluationJob>) {
    info!("Evaluation worker started");
    while let Some(job) = rx.recv().await {
        let results = ctx.evaluate(&job.positions, Utc::now()).await;
        if let Some(reply) = job.reply {
            let _ = reply.send(results);
        }
    }
    info!("Evaluation worker stopped");
}

/// Handle to the running engine.
pub struct EngineService {
    ctx: Arc<EngineContext>,
    jobs: mpsc::Sender<EvaluationJob>,
}

impl EngineService {
    /// Spawns the evaluation worker. The worker stops once the service is dropped.
    #[must_use]
    pub fn start(ctx: EngineContext) -> (Arc<Self>, JoinHandle<()>) {
        let capacity = ctx.config.borrow().scheduler.queue_capacity.max(1);
        let ctx = Arc::new(ctx);
        let (jobs, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_worker(Arc::clone(&ctx), rx));
        (Arc::new(Self { ctx, jobs }), worker)
    }

    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Queues positions for evaluation without waiting.
    ///
    /// # Errors
    ///
    /// `Shutdown` when the worker has stopped.
    pub async fn enqueue(&self, positions: Vec<PositionId>) -> Result<(), EngineError> {
        self.jobs
            .send(EvaluationJob {
                positions,
                reply: None,
            })
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// Queues positions and waits for their results.
    ///
    /// # Errors
    ///
    /// `Shutdown` when the worker has stopped.
    pub async fn evaluate_now(
        &self,
        positions: Vec<PositionId>,
    ) -> Result<Vec<HealthCheckResult>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(EvaluationJob {
                positions,
                reply: Some(tx),
            })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Queues every active position.
    ///
    /// # Errors
    ///
    /// `Shutdown` when the worker has stopped.
    pub async fn health_pass(&self) -> Result<usize, EngineError> {
        let ids = self.ctx.store.active_position_ids();
        let count = ids.len();
        if count > 0 {
            self.enqueue(ids).await?;
        }
        Ok(count)
    }

    /// Spawns the interval tasks. Cadences are read once; thresholds reload live.
    #[must_use]
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let scheduler = self.ctx.config.borrow().scheduler.clone();
        info!(
            regime_secs = scheduler.regime_interval_secs,
            health_secs = scheduler.health_interval_secs,
            sweep_secs = scheduler.plan_sweep_interval_secs,
            flush_secs = scheduler.alert_flush_interval_secs,
            "Engine background tasks starting"
        );

        let mut tasks = Vec::with_capacity(5);

        let ctx = Arc::clone(&self.ctx);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(secs(scheduler.regime_interval_secs));
            loop {
                interval.tick().await;
                ctx.refresh_regime(Utc::now()).await;
            }
        }));

        let service = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(secs(scheduler.health_interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = service.health_pass().await {
                    error!(error = %e, "Health pass could not be queued");
                    break;
                }
            }
        }));

        let ctx = Arc::clone(&self.ctx);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(secs(scheduler.plan_sweep_interval_secs));
            loop {
                interval.tick().await;
                ctx.sweep_expired(Utc::now()).await;
            }
        }));

        let ctx = Arc::clone(&self.ctx);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(secs(scheduler.alert_flush_interval_secs));
            loop {
                interval.tick().await;
                ctx.alerts.flush().await;
            }
        }));

        let ctx = Arc::clone(&self.ctx);
        let mut config = ctx.config.clone();
        tasks.push(tokio::spawn(async move {
            while config.changed().await.is_ok() {
                let latest = config.borrow_and_update().clone();
                ctx.apply_config(&latest);
                info!("Engine configuration applied");
            }
        }));

        tasks
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}
