//! Flight Manual: the structured explanation attached to every entry plan.
//!
//! Pure computation over known fields. Probability of profit integrates a
//! lognormal terminal distribution of the underlying over the price
//! intervals where the expiration payoff is positive.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::greeks::{norm_cdf, norm_pdf};
use crate::payoff::{LossBound, PayoffProfile};
use crate::regime::RegimeState;
use crate::types::{GreeksSnapshot, Leg, StrategyType};

/// Fixed-schema rationale for a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub strategy: StrategyType,
    pub contracts: u32,
    pub probability_of_profit: f64,
    pub max_gain_per_unit: LossBound,
    pub max_loss_per_unit: LossBound,
    pub max_gain_total: LossBound,
    pub max_loss_total: LossBound,
    pub breakevens: Vec<Decimal>,
    /// Distinct strikes, ascending.
    pub key_levels: Vec<Decimal>,
    pub greeks_line: String,
    pub economics_line: String,
    pub thesis_line: String,
    pub summary: String,
}

/// Everything the explainer reads.
#[derive(Debug, Clone, Copy)]
pub struct ExplainInput<'a> {
    pub strategy: StrategyType,
    pub legs: &'a [Leg],
    pub contracts: u32,
    /// Net Greeks of one structure unit.
    pub greeks: &'a GreeksSnapshot,
    pub spot: f64,
    pub volatility: f64,
    pub days_to_expiry: f64,
    pub rate: f64,
    pub regime: &'a RegimeState,
    pub multiplier: Decimal,
}

/// P(a < S_T < b) for a lognormal terminal price.
fn lognormal_mass(spot: f64, vol: f64, years: f64, rate: f64, lo: f64, hi: Option<f64>) -> f64 {
    let drift = (rate - vol * vol / 2.0) * years;
    let scale = vol * years.sqrt();
    let cdf = |x: f64| {
        if x <= 0.0 {
            0.0
        } else {
            norm_cdf(((x / spot).ln() - drift) / scale)
        }
    };
    let upper = hi.map_or(1.0, cdf);
    (upper - cdf(lo)).max(0.0)
}

/// Probability that the structure finishes in profit.
#[must_use]
pub fn probability_of_profit(
    profile: &PayoffProfile,
    spot: f64,
    vol: f64,
    days_to_expiry: f64,
    rate: f64,
) -> f64 {
    let intervals = profile.profitable_intervals();
    let years = days_to_expiry / 365.0;

    if years <= 0.0 || vol <= 0.0 || !vol.is_finite() || spot <= 0.0 {
        let inside = intervals.iter().any(|(lo, hi)| {
            let lo = lo.to_f64().unwrap_or(0.0);
            spot > lo && hi.and_then(|h| h.to_f64()).map_or(true, |h| spot < h)
        });
        return if inside { 1.0 } else { 0.0 };
    }

    intervals
        .iter()
        .map(|(lo, hi)| {
            lognormal_mass(
                spot,
                vol,
                years,
                rate,
                lo.to_f64().unwrap_or(0.0),
                hi.and_then(|h| h.to_f64()),
            )
        })
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// Win/loss statistics of the expiration payoff, the inputs to Kelly sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub win_probability: f64,
    /// Mean payoff given a win, dollars per unit.
    pub average_win: f64,
    /// Mean loss given a loss, positive dollars per unit.
    pub average_loss: f64,
}

impl OutcomeStats {
    /// Average win over average loss. Infinite when the structure cannot lose.
    #[must_use]
    pub fn payoff_ratio(&self) -> f64 {
        if self.average_loss <= 0.0 {
            return f64::INFINITY;
        }
        self.average_win / self.average_loss
    }
}

const OUTCOME_STEPS: usize = 400;
const OUTCOME_SIGMAS: f64 = 5.0;

/// Integrates the payoff against the lognormal terminal distribution on a
/// grid of ±5 standard deviations.
#[must_use]
pub fn expected_outcome(
    profile: &PayoffProfile,
    spot: f64,
    vol: f64,
    days_to_expiry: f64,
    rate: f64,
) -> OutcomeStats {
    let years = days_to_expiry / 365.0;
    let value = |price: f64| {
        Decimal::from_f64(price)
            .map(|p| profile.value_at(p))
            .and_then(|v| v.to_f64())
            .unwrap_or(0.0)
    };

    if years <= 0.0 || vol <= 0.0 || !vol.is_finite() || spot <= 0.0 {
        let v = value(spot);
        return OutcomeStats {
            win_probability: if v > 0.0 { 1.0 } else { 0.0 },
            average_win: v.max(0.0),
            average_loss: (-v).max(0.0),
        };
    }

    let drift = (rate - vol * vol / 2.0) * years;
    let scale = vol * years.sqrt();
    let dz = 2.0 * OUTCOME_SIGMAS / OUTCOME_STEPS as f64;

    let (mut p_win, mut win_mass, mut p_loss, mut loss_mass, mut total) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for i in 0..OUTCOME_STEPS {
        let z = -OUTCOME_SIGMAS + (i as f64 + 0.5) * dz;
        let w = norm_pdf(z) * dz;
        let v = value(spot * (drift + scale * z).exp());
        total += w;
        if v > 0.0 {
            p_win += w;
            win_mass += w * v;
        } else if v < 0.0 {
            p_loss += w;
            loss_mass += w * -v;
        }
    }

    OutcomeStats {
        win_probability: if total > 0.0 { (p_win / total).clamp(0.0, 1.0) } else { 0.0 },
        average_win: if p_win > 0.0 { win_mass / p_win } else { 0.0 },
        average_loss: if p_loss > 0.0 { loss_mass / p_loss } else { 0.0 },
    }
}

fn strategy_thesis(strategy: StrategyType) -> &'static str {
    match strategy {
        StrategyType::BullPutSpread => "Profits if the underlying holds above the short put.",
        StrategyType::BearCallSpread => "Profits if the underlying stays below the short call.",
        StrategyType::BullCallSpread => "Profits from a move up through the long call.",
        StrategyType::BearPutSpread => "Profits from a move down through the long put.",
        StrategyType::IronCondor => "Profits if the underlying stays between the short strikes.",
        StrategyType::LongStraddle => "Profits from a large move in either direction.",
        StrategyType::LongCall => "Profits from a rally above the breakeven.",
        StrategyType::LongPut => "Profits from a decline below the breakeven.",
        StrategyType::Custom => "Custom structure.",
    }
}

fn join_levels(levels: &[Decimal]) -> String {
    if levels.is_empty() {
        return "none".to_string();
    }
    levels
        .iter()
        .map(|l| l.round_dp(2).normalize().to_string())
        .collect::<Vec<_>>()
        .join(" / ")
}

/// Builds the explanation.
#[must_use]
pub fn explain(input: &ExplainInput<'_>) -> Explanation {
    let profile = PayoffProfile::new(input.legs, input.multiplier);
    let units = Decimal::from(input.contracts);

    let max_gain_per_unit = profile.max_gain();
    let max_loss_per_unit = profile.max_loss();
    let max_gain_total = max_gain_per_unit.scale(units);
    let max_loss_total = max_loss_per_unit.scale(units);
    let breakevens = profile.breakevens();

    let mut key_levels: Vec<Decimal> = input.legs.iter().map(|l| l.contract.strike).collect();
    key_levels.sort();
    key_levels.dedup();

    let pop = probability_of_profit(
        &profile,
        input.spot,
        input.volatility,
        input.days_to_expiry,
        input.rate,
    );

    let g = input.greeks;
    let dollars = input.multiplier.to_f64().unwrap_or(100.0) * f64::from(input.contracts);
    let greeks_line = format!(
        "Delta {:+.2}, gamma {:.3}, theta {:+.2}/day, vega {:.2}/vol pt per unit; ${:+.0}/day decay across {} units",
        g.delta,
        g.gamma,
        g.theta,
        g.vega,
        g.theta * dollars,
        input.contracts
    );

    let net_premium: Decimal = input.legs.iter().map(Leg::premium).sum::<Decimal>() * input.multiplier;
    let premium_word = if net_premium >= Decimal::ZERO { "Collect" } else { "Pay" };
    let economics_line = format!(
        "{premium_word} ${} per unit (${} total); max gain {} ({} total), max loss {} ({} total)",
        net_premium.abs().round_dp(2),
        (net_premium.abs() * units).round_dp(2),
        max_gain_per_unit,
        max_gain_total,
        max_loss_per_unit,
        max_loss_total,
    );

    let thesis_line = format!(
        "{} {}",
        input.regime.description,
        strategy_thesis(input.strategy)
    );

    let ticker = input
        .legs
        .first()
        .map(|l| l.contract.symbol.as_str())
        .unwrap_or("?");
    let summary = format!(
        "{}x {} on {}: {:.0}% probability of profit, max loss {}, breakeven {}.",
        input.contracts,
        input.strategy,
        ticker,
        pop * 100.0,
        max_loss_total,
        join_levels(&breakevens)
    );

    Explanation {
        strategy: input.strategy,
        contracts: input.contracts,
        probability_of_profit: pop,
        max_gain_per_unit,
        max_loss_per_unit,
        max_gain_total,
        max_loss_total,
        breakevens,
        key_levels,
        greeks_line,
        economics_line,
        thesis_line,
        summary,
    }
}
