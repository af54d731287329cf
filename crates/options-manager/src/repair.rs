//! Repair Engine: hedge search for positions whose delta has drifted.
//!
//! Candidates are vertical spreads on the position's underlying, sized in
//! whole multiples of the position's structure units. A candidate qualifies
//! only if it brings drift back inside the Green band and strictly reduces
//! |delta|. Qualifying candidates are ranked by net credit, then by the
//! smallest resulting max loss.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use options_guard_core::{AppConfig, HealthConfig, RepairConfig};
use options_guard_gateway::{OptionQuote, OptionRight, OptionsChain};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::greeks;
use crate::payoff::{LossBound, PayoffProfile};
use crate::types::{
    GreeksSnapshot, HealthStatus, Leg, PlanStatus, Position, PositionId, Priority, PricingInputs,
    RepairPlan,
};

/// Owned inputs for one repair search.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub position: Position,
    /// Current unit Greeks of the position.
    pub snapshot: GreeksSnapshot,
    pub chain: Arc<OptionsChain>,
    pub spot: Decimal,
    pub status: HealthStatus,
    pub drift: f64,
    pub equity: Decimal,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RepairOutcome {
    Plan(Box<RepairPlan>),
    /// No qualifying hedge; keep monitoring.
    NoSafeRepair {
        position_id: PositionId,
        priority: Priority,
        reason: String,
    },
}

impl RepairOutcome {
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            Self::Plan(plan) => plan.priority,
            Self::NoSafeRepair { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("repair search for {position_id} failed: {reason}")]
pub struct RepairError {
    pub position_id: PositionId,
    pub reason: String,
}

/// A qualifying hedge.
#[derive(Debug, Clone)]
pub struct HedgeCandidate {
    /// Hedge legs, quantities per position unit.
    pub legs: Vec<Leg>,
    pub post_greeks: GreeksSnapshot,
    /// Dollars for the whole position; negative is a debit.
    pub net_credit: Decimal,
    pub max_loss: LossBound,
}

/// Plan priority from the breach severity and the loss relative to equity.
#[must_use]
pub fn priority(
    status: HealthStatus,
    drift: f64,
    unrealized_pnl: Decimal,
    equity: Decimal,
    health: &HealthConfig,
    repair: &RepairConfig,
) -> Priority {
    let base = if drift >= health.red_band * repair.critical_drift_multiple {
        Priority::Critical
    } else if status == HealthStatus::Red {
        Priority::High
    } else if drift <= health.yellow_band + (health.red_band - health.yellow_band) / 2.0 {
        Priority::Low
    } else {
        Priority::Medium
    };

    let loss = (-unrealized_pnl).max(Decimal::ZERO);
    let threshold = equity * Decimal::try_from(repair.loss_escalation_pct).unwrap_or(Decimal::ONE);
    if equity > Decimal::ZERO && loss > Decimal::ZERO && loss >= threshold {
        base.escalate()
    } else {
        base
    }
}

struct PricedQuote<'a> {
    quote: &'a OptionQuote,
    greeks: GreeksSnapshot,
}

fn price_strip<'a>(
    strip: Vec<&'a OptionQuote>,
    spot: f64,
    window_pct: f64,
    rate: f64,
    now: DateTime<Utc>,
) -> Vec<PricedQuote<'a>> {
    strip
        .into_iter()
        .filter_map(|quote| {
            let strike = quote.contract.strike.to_f64()?;
            if (strike - spot).abs() > spot * window_pct {
                return None;
            }
            let inputs = PricingInputs {
                spot,
                strike,
                days_to_expiry: quote.contract.days_to_expiry(now) as f64,
                volatility: quote.iv,
                rate,
                right: quote.contract.right,
            };
            greeks::calculate(&inputs, now)
                .ok()
                .map(|greeks| PricedQuote { quote, greeks })
        })
        .collect()
}

/// Every qualifying hedge for the request.
#[must_use]
pub fn candidates(req: &RepairRequest, config: &AppConfig) -> Vec<HedgeCandidate> {
    let repair = &config.repair;
    let health = &config.health;
    let multiplier = config.pricing.contract_multiplier;
    let units = Decimal::from(req.position.contracts);
    let target = req.position.target_delta;
    let pre = req.snapshot.delta;
    let Some(spot) = req.spot.to_f64() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for expiry in req.chain.expirations() {
        let dte = (expiry - req.now.date_naive()).num_days();
        if dte < repair.min_dte || dte > repair.max_dte {
            continue;
        }
        for right in [OptionRight::Put, OptionRight::Call] {
            let strip = price_strip(
                req.chain.strip(expiry, right),
                spot,
                repair.strike_window_pct,
                config.pricing.risk_free_rate,
                req.now,
            );
            for (i, short) in strip.iter().enumerate() {
                if short.quote.bid <= Decimal::ZERO {
                    continue;
                }
                for (j, long) in strip.iter().enumerate() {
                    let width = i.abs_diff(j);
                    if width == 0 || width > repair.max_width_steps || long.quote.ask <= Decimal::ZERO {
                        continue;
                    }
                    let spread_delta = long.greeks.delta - short.greeks.delta;
                    for ratio in 1..=repair.max_hedge_ratio.max(1) {
                        let r = i32::try_from(ratio).unwrap_or(i32::MAX);
                        let post_delta = pre + f64::from(r) * spread_delta;
                        if (post_delta - target).abs() > health.yellow_band || post_delta.abs() >= pre.abs() {
                            continue;
                        }

                        let legs = vec![
                            Leg::new(short.quote.contract.clone(), -r, short.quote.bid),
                            Leg::new(long.quote.contract.clone(), r, long.quote.ask),
                        ];
                        let per_share: Decimal = legs.iter().map(Leg::premium).sum();
                        let post_greeks = greeks::combine(
                            &[
                                (1, req.snapshot.clone()),
                                (-r, short.greeks.clone()),
                                (r, long.greeks.clone()),
                            ],
                            req.now,
                        );
                        let mut all_legs = req.position.legs.clone();
                        all_legs.extend(legs.iter().cloned());
                        let max_loss = PayoffProfile::new(&all_legs, multiplier).max_loss().scale(units);

                        out.push(HedgeCandidate {
                            legs,
                            post_greeks,
                            net_credit: per_share * multiplier * units,
                            max_loss,
                        });
                    }
                }
            }
        }
    }
    out
}

/// Highest credit, then lowest resulting max loss.
#[must_use]
pub fn select(mut candidates: Vec<HedgeCandidate>) -> Option<HedgeCandidate> {
    candidates.sort_by(|a, b| {
        b.net_credit
            .cmp(&a.net_credit)
            .then_with(|| a.max_loss.cmp(&b.max_loss))
    });
    candidates.into_iter().next()
}

fn describe(legs: &[Leg]) -> String {
    legs.iter()
        .map(|l| {
            let verb = if l.quantity < 0 { "sell" } else { "buy" };
            format!("{verb} {}x {}", l.quantity.unsigned_abs(), l.contract.display_name())
        })
        .collect::<Vec<_>>()
        .join(" / ")
}

/// Searches for a hedge and builds the plan.
#[must_use]
pub fn find_repair(req: &RepairRequest, config: &AppConfig) -> RepairOutcome {
    let position = &req.position;
    let prio = priority(
        req.status,
        req.drift,
        position.unrealized_pnl,
        req.equity,
        &config.health,
        &config.repair,
    );

    let found = candidates(req, config);
    let considered = found.len();
    let Some(best) = select(found) else {
        info!(
            position_id = %position.id,
            ticker = position.ticker,
            drift = req.drift,
            "No safe repair found"
        );
        return RepairOutcome::NoSafeRepair {
            position_id: position.id,
            priority: prio,
            reason: format!(
                "no hedge within {} strikes brings delta {:+.2} back within {:.2} of target {:+.2}",
                config.repair.max_width_steps,
                req.snapshot.delta,
                config.health.yellow_band,
                position.target_delta
            ),
        };
    };

    let id = Uuid::new_v4();
    let pre = req.snapshot.delta;
    let post = best.post_greeks.delta;
    let headline = format!(
        "{}: delta {:+.2} vs target {:+.2}. Hedge to {:+.2}",
        position.ticker, pre, position.target_delta, post
    );
    let credit_word = if best.net_credit >= Decimal::ZERO { "collects" } else { "pays" };
    let reason = format!(
        "{}; {} ${} and leaves max loss at {}",
        describe(&best.legs),
        credit_word,
        best.net_credit.abs().round_dp(2),
        best.max_loss
    );

    debug!(
        position_id = %position.id,
        considered,
        pre_delta = pre,
        post_delta = post,
        credit = %best.net_credit,
        "Repair selected"
    );

    RepairOutcome::Plan(Box::new(RepairPlan {
        id,
        position_id: position.id,
        user_id: position.user_id.clone(),
        idempotency_key: format!("repair-{id}"),
        hedge_legs: best.legs,
        contracts: position.contracts,
        pre_delta: pre,
        post_greeks: best.post_greeks,
        net_credit: best.net_credit,
        new_max_loss: best.max_loss,
        priority: prio,
        headline,
        reason,
        priced_spot: req.spot,
        created_at: req.now,
        expires_at: req.now + Duration::seconds(config.repair.plan_ttl_secs),
        status: PlanStatus::Pending,
        status_reason: None,
        resolved_at: None,
    }))
}

/// Runs one blocking search per request and collects the outcomes. A panic
/// in one search becomes that position's error.
pub async fn evaluate_batch(
    requests: Vec<RepairRequest>,
    config: Arc<AppConfig>,
) -> Vec<(PositionId, Result<RepairOutcome, RepairError>)> {
    let tasks = requests.into_iter().map(|req| {
        let config = Arc::clone(&config);
        let position_id = req.position.id;
        let handle = tokio::task::spawn_blocking(move || find_repair(&req, &config));
        async move {
            let result = handle.await.map_err(|e| {
                warn!(%position_id, error = %e, "Repair task failed");
                RepairError {
                    position_id,
                    reason: e.to_string(),
                }
            });
            (position_id, result)
        }
    });
    join_all(tasks).await
}
