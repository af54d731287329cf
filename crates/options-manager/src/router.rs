//! Strategy routing: regime and risk tolerance to a strategy shape.
//!
//! The router never places orders. [`route`] is a table lookup and
//! [`build_entry_legs`] turns a recommendation into concrete legs from an
//! option chain.

use chrono::{DateTime, NaiveDate, Utc};
use options_guard_core::RouterConfig;
use options_guard_gateway::{OptionQuote, OptionRight, OptionsChain};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::greeks;
use crate::regime::{RegimeKind, RegimeState};
use crate::types::{Leg, PricingInputs, RiskTolerance, StrategyType};

/// Default strike and expiration selection for a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRules {
    /// Target |delta| of the short leg. Single-leg and straddle entries buy at this delta.
    pub short_delta: f64,
    /// Strike steps between the short leg and its wing.
    pub wing_steps: usize,
    pub min_dte: i64,
    pub max_dte: i64,
}

impl SelectionRules {
    const fn new(short_delta: f64, wing_steps: usize, min_dte: i64, max_dte: i64) -> Self {
        Self {
            short_delta,
            wing_steps,
            min_dte,
            max_dte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecommendation {
    pub strategy: StrategyType,
    pub rules: SelectionRules,
    pub regime: RegimeKind,
    pub regime_confidence: f64,
    /// Tolerance actually used after small-account downgrade.
    pub tolerance: RiskTolerance,
    pub rationale: String,
    /// True when the conservative default replaced the table entry.
    pub fallback: bool,
}

const CONSERVATIVE: (StrategyType, SelectionRules) =
    (StrategyType::IronCondor, SelectionRules::new(0.10, 1, 30, 45));

fn table(regime: RegimeKind, tolerance: RiskTolerance) -> Option<(StrategyType, SelectionRules)> {
    use RegimeKind as R;
    use RiskTolerance as T;
    use StrategyType as S;

    let entry = match (regime, tolerance) {
        (R::TrendingUp, T::Low) => (S::BullPutSpread, SelectionRules::new(0.20, 1, 30, 45)),
        (R::TrendingUp, T::Medium) => (S::BullPutSpread, SelectionRules::new(0.30, 2, 30, 45)),
        (R::TrendingUp, T::High) => (S::BullCallSpread, SelectionRules::new(0.35, 2, 21, 45)),

        (R::TrendingDown, T::Low) => (S::BearCallSpread, SelectionRules::new(0.20, 1, 30, 45)),
        (R::TrendingDown, T::Medium) => (S::BearCallSpread, SelectionRules::new(0.30, 2, 30, 45)),
        (R::TrendingDown, T::High) => (S::BearPutSpread, SelectionRules::new(0.35, 2, 21, 45)),

        (R::RangeBound, T::Low) => (S::IronCondor, SelectionRules::new(0.16, 1, 30, 45)),
        (R::RangeBound, T::Medium) => (S::IronCondor, SelectionRules::new(0.20, 2, 30, 45)),
        (R::RangeBound, T::High) => (S::IronCondor, SelectionRules::new(0.25, 2, 21, 45)),

        (R::HighVolatilityChop, T::Low) => (S::IronCondor, SelectionRules::new(0.10, 1, 30, 60)),
        (R::HighVolatilityChop, T::Medium) => (S::IronCondor, SelectionRules::new(0.15, 1, 30, 60)),
        (R::HighVolatilityChop, T::High) => (S::IronCondor, SelectionRules::new(0.20, 2, 30, 60)),

        (R::EarningsWindow, T::Low) => return None,
        (R::EarningsWindow, T::Medium) => (S::IronCondor, SelectionRules::new(0.15, 2, 7, 21)),
        (R::EarningsWindow, T::High) => (S::LongStraddle, SelectionRules::new(0.50, 0, 7, 21)),

        (R::MacroEvent, T::Low | T::Medium) => return None,
        (R::MacroEvent, T::High) => (S::IronCondor, SelectionRules::new(0.12, 2, 7, 30)),

        (R::Normal, T::Low) => (S::IronCondor, SelectionRules::new(0.16, 1, 30, 45)),
        (R::Normal, T::Medium) => (S::BullPutSpread, SelectionRules::new(0.25, 2, 30, 45)),
        (R::Normal, T::High) => (S::BullPutSpread, SelectionRules::new(0.30, 2, 30, 45)),
    };
    Some(entry)
}

/// Recommends a strategy for the regime and the user's risk profile.
#[must_use]
pub fn route(
    state: &RegimeState,
    tolerance: RiskTolerance,
    equity: Decimal,
    config: &RouterConfig,
) -> StrategyRecommendation {
    let tolerance = if equity < config.small_account_equity {
        RiskTolerance::Low
    } else {
        tolerance
    };

    let fallback_reason = if equity <= Decimal::ZERO {
        Some("account has no equity".to_string())
    } else if state.confidence < config.min_confidence {
        Some(format!(
            "regime confidence {:.2} below {:.2}",
            state.confidence, config.min_confidence
        ))
    } else {
        None
    };

    let (strategy, rules, rationale, fallback) = match fallback_reason {
        Some(reason) => (
            CONSERVATIVE.0,
            CONSERVATIVE.1,
            format!("Conservative default: {reason}."),
            true,
        ),
        None => match table(state.regime, tolerance) {
            Some((strategy, rules)) => (
                strategy,
                rules,
                format!("{} {}", state.regime.description(), tolerance_note(tolerance)),
                false,
            ),
            None => (
                CONSERVATIVE.0,
                CONSERVATIVE.1,
                format!(
                    "{} Event risk is outside {tolerance} tolerance; using the conservative default.",
                    state.regime.description()
                ),
                true,
            ),
        },
    };

    debug!(regime = %state.regime, %tolerance, %strategy, fallback, "Strategy routed");

    StrategyRecommendation {
        strategy,
        rules,
        regime: state.regime,
        regime_confidence: state.confidence,
        tolerance,
        rationale,
        fallback,
    }
}

fn tolerance_note(tolerance: RiskTolerance) -> &'static str {
    match tolerance {
        RiskTolerance::Low => "Sized for low risk tolerance with narrow wings.",
        RiskTolerance::Medium => "Sized for medium risk tolerance.",
        RiskTolerance::High => "High tolerance allows closer strikes and directional debit.",
    }
}

/// Expiration inside the DTE range closest to its midpoint.
fn pick_expiry(chain: &OptionsChain, rules: &SelectionRules, now: DateTime<Utc>) -> Option<NaiveDate> {
    let target = (rules.min_dte + rules.max_dte) / 2;
    chain
        .expirations()
        .into_iter()
        .filter(|e| {
            let dte = (*e - now.date_naive()).num_days();
            dte >= rules.min_dte && dte <= rules.max_dte
        })
        .min_by_key(|e| ((*e - now.date_naive()).num_days() - target).abs())
}

fn quote_delta(quote: &OptionQuote, spot: f64, rate: f64, now: DateTime<Utc>) -> Option<f64> {
    let inputs = PricingInputs {
        spot,
        strike: quote.contract.strike.to_f64()?,
        days_to_expiry: quote.contract.days_to_expiry(now) as f64,
        volatility: quote.iv,
        rate,
        right: quote.contract.right,
    };
    greeks::calculate(&inputs, now).ok().map(|g| g.delta)
}

/// Index in a strike-sorted strip whose |delta| is closest to `target`.
fn index_by_delta(strip: &[&OptionQuote], target: f64, spot: f64, rate: f64, now: DateTime<Utc>) -> Option<usize> {
    strip
        .iter()
        .enumerate()
        .filter_map(|(i, q)| quote_delta(q, spot, rate, now).map(|d| (i, (d.abs() - target).abs())))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Moves `steps` strikes away from the money (`otm = true`) or toward it.
fn step_index(index: usize, steps: usize, right: OptionRight, otm: bool, len: usize) -> Option<usize> {
    let up = matches!((right, otm), (OptionRight::Call, true) | (OptionRight::Put, false));
    let moved = if up { index.checked_add(steps)? } else { index.checked_sub(steps)? };
    (moved < len).then_some(moved)
}

fn short_leg(quote: &OptionQuote) -> Result<Leg, EngineError> {
    if quote.bid <= Decimal::ZERO {
        return Err(EngineError::NoEntry(format!("no bid for {}", quote.contract.display_name())));
    }
    Ok(Leg::new(quote.contract.clone(), -1, quote.bid))
}

fn long_leg(quote: &OptionQuote) -> Result<Leg, EngineError> {
    if quote.ask <= Decimal::ZERO {
        return Err(EngineError::NoEntry(format!("no ask for {}", quote.contract.display_name())));
    }
    Ok(Leg::new(quote.contract.clone(), 1, quote.ask))
}

/// Strike picker bound to one expiration of a chain.
struct LegPicker<'a> {
    chain: &'a OptionsChain,
    expiry: NaiveDate,
    spot: f64,
    rate: f64,
    now: DateTime<Utc>,
}

impl LegPicker<'_> {
    fn strip_index(&self, right: OptionRight, target: f64) -> Result<(Vec<&OptionQuote>, usize), EngineError> {
        let strip = self.chain.strip(self.expiry, right);
        let i = index_by_delta(&strip, target, self.spot, self.rate, self.now).ok_or_else(|| {
            EngineError::NoEntry(format!("no priced {right} strikes for {}", self.expiry))
        })?;
        Ok((strip, i))
    }

    /// Short leg at the target delta plus a long wing. Credit spreads put the
    /// wing further out of the money; debit spreads buy the strike closer to it.
    fn vertical(&self, right: OptionRight, credit: bool, rules: &SelectionRules) -> Result<Vec<Leg>, EngineError> {
        let (strip, short) = self.strip_index(right, rules.short_delta)?;
        let wing = step_index(short, rules.wing_steps.max(1), right, credit, strip.len()).ok_or_else(|| {
            EngineError::NoEntry(format!("chain too narrow for a {}-step wing", rules.wing_steps))
        })?;
        Ok(vec![short_leg(strip[short])?, long_leg(strip[wing])?])
    }

    fn single(&self, right: OptionRight, rules: &SelectionRules) -> Result<Leg, EngineError> {
        let (strip, i) = self.strip_index(right, rules.short_delta)?;
        long_leg(strip[i])
    }
}

/// Concrete entry legs for a recommendation, one structure unit.
///
/// Short legs are priced at the bid and long legs at the ask.
///
/// # Errors
///
/// Returns [`EngineError::NoEntry`] when the chain has no expiration in the
/// DTE range, no priced strikes, or is too narrow for the wings.
pub fn build_entry_legs(
    rec: &StrategyRecommendation,
    chain: &OptionsChain,
    spot: f64,
    rate: f64,
    now: DateTime<Utc>,
) -> Result<Vec<Leg>, EngineError> {
    let rules = &rec.rules;
    let expiry = pick_expiry(chain, rules, now).ok_or_else(|| {
        EngineError::NoEntry(format!(
            "no {} expiration between {} and {} DTE",
            chain.underlying, rules.min_dte, rules.max_dte
        ))
    })?;

    let picker = LegPicker {
        chain,
        expiry,
        spot,
        rate,
        now,
    };

    let legs = match rec.strategy {
        StrategyType::BullPutSpread => picker.vertical(OptionRight::Put, true, rules)?,
        StrategyType::BearCallSpread => picker.vertical(OptionRight::Call, true, rules)?,
        StrategyType::BullCallSpread => picker.vertical(OptionRight::Call, false, rules)?,
        StrategyType::BearPutSpread => picker.vertical(OptionRight::Put, false, rules)?,
        StrategyType::IronCondor => {
            let mut legs = picker.vertical(OptionRight::Put, true, rules)?;
            legs.extend(picker.vertical(OptionRight::Call, true, rules)?);
            legs
        }
        StrategyType::LongCall => vec![picker.single(OptionRight::Call, rules)?],
        StrategyType::LongPut => vec![picker.single(OptionRight::Put, rules)?],
        StrategyType::LongStraddle => {
            let call = picker.single(OptionRight::Call, rules)?;
            let put = chain
                .find(expiry, call.contract.strike, OptionRight::Put)
                .ok_or_else(|| EngineError::NoEntry(format!("no put at {}", call.contract.strike)))?;
            let put = long_leg(put)?;
            vec![call, put]
        }
        StrategyType::Custom => {
            return Err(EngineError::NoEntry("custom structures are not routed".to_string()))
        }
    };

    debug!(
        strategy = %rec.strategy,
        %expiry,
        legs = legs.len(),
        "Entry legs selected"
    );
    Ok(legs)
}

/// Net delta the entry is built to hold, per structure unit.
///
/// # Errors
///
/// Propagates [`crate::error::DomainError`] from pricing.
pub fn entry_delta(
    legs: &[Leg],
    spot: f64,
    chain: &OptionsChain,
    rate: f64,
    now: DateTime<Utc>,
) -> Result<f64, EngineError> {
    Ok(greeks::position_greeks(legs, spot, chain, rate, now)?.delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::WindowInfo;
    use crate::test_support::{chain, now, RATE};
    use rust_decimal_macros::dec;

    fn state(regime: RegimeKind, confidence: f64) -> RegimeState {
        RegimeState {
            regime,
            confidence,
            window: WindowInfo::default(),
            is_shift: false,
            description: regime.description().to_string(),
            computed_at: now(),
        }
    }

    // ============================================
    // Routing Table
    // ============================================

    #[test]
    fn trending_up_medium_sells_put_spreads() {
        let rec = route(
            &state(RegimeKind::TrendingUp, 0.8),
            RiskTolerance::Medium,
            dec!(50_000),
            &RouterConfig::default(),
        );
        assert_eq!(rec.strategy, StrategyType::BullPutSpread);
        assert!(!rec.fallback);
        assert!((rec.rules.short_delta - 0.30).abs() < 1e-12);
    }

    #[test]
    fn low_confidence_falls_back() {
        let rec = route(
            &state(RegimeKind::TrendingUp, 0.2),
            RiskTolerance::High,
            dec!(50_000),
            &RouterConfig::default(),
        );
        assert!(rec.fallback);
        assert_eq!(rec.strategy, StrategyType::IronCondor);
    }

    #[test]
    fn small_account_routes_as_low_tolerance() {
        let rec = route(
            &state(RegimeKind::TrendingDown, 0.9),
            RiskTolerance::High,
            dec!(5_000),
            &RouterConfig::default(),
        );
        assert_eq!(rec.tolerance, RiskTolerance::Low);
        assert_eq!(rec.strategy, StrategyType::BearCallSpread);
    }

    #[test]
    fn macro_event_for_low_tolerance_is_conservative() {
        let rec = route(
            &state(RegimeKind::MacroEvent, 0.95),
            RiskTolerance::Low,
            dec!(50_000),
            &RouterConfig::default(),
        );
        assert!(rec.fallback);
    }

    #[test]
    fn zero_equity_falls_back() {
        let rec = route(
            &state(RegimeKind::RangeBound, 0.9),
            RiskTolerance::Medium,
            Decimal::ZERO,
            &RouterConfig::default(),
        );
        assert!(rec.fallback);
    }

    // ============================================
    // Leg Building
    // ============================================

    #[test]
    fn bull_put_spread_legs_from_chain() {
        let c = chain("SPY", dec!(100), dec!(1), 0.20, &[14, 35, 90]);
        let rec = route(
            &state(RegimeKind::TrendingUp, 0.8),
            RiskTolerance::Medium,
            dec!(50_000),
            &RouterConfig::default(),
        );
        let legs = build_entry_legs(&rec, &c, 100.0, RATE, now()).unwrap();

        assert_eq!(legs.len(), 2);
        let (short, long) = (&legs[0], &legs[1]);
        assert_eq!(short.quantity, -1);
        assert_eq!(long.quantity, 1);
        assert_eq!(short.contract.right, OptionRight::Put);
        assert_eq!(long.contract.strike, short.contract.strike - dec!(2));
        assert_eq!(short.contract.days_to_expiry(now()), 35);
        assert!(short.contract.strike < dec!(100));

        let credit: Decimal = legs.iter().map(Leg::premium).sum();
        assert!(credit > Decimal::ZERO);
    }

    #[test]
    fn iron_condor_has_four_legs_around_spot() {
        let c = chain("SPY", dec!(100), dec!(1), 0.20, &[35]);
        let rec = route(
            &state(RegimeKind::RangeBound, 0.8),
            RiskTolerance::Low,
            dec!(50_000),
            &RouterConfig::default(),
        );
        let legs = build_entry_legs(&rec, &c, 100.0, RATE, now()).unwrap();
        assert_eq!(legs.len(), 4);
        assert!(legs[0].contract.strike < dec!(100));
        assert!(legs[2].contract.strike > dec!(100));
        let delta = entry_delta(&legs, 100.0, &c, RATE, now()).unwrap();
        assert!(delta.abs() < 0.1);
    }

    #[test]
    fn bull_call_spread_buys_the_closer_strike() {
        let c = chain("SPY", dec!(100), dec!(1), 0.20, &[35]);
        let rec = route(
            &state(RegimeKind::TrendingUp, 0.8),
            RiskTolerance::High,
            dec!(50_000),
            &RouterConfig::default(),
        );
        let legs = build_entry_legs(&rec, &c, 100.0, RATE, now()).unwrap();
        assert_eq!(legs[1].contract.strike, legs[0].contract.strike - dec!(2));
        assert_eq!(legs[1].quantity, 1);
    }

    #[test]
    fn no_expiration_in_range_is_no_entry() {
        let c = chain("SPY", dec!(100), dec!(1), 0.20, &[7]);
        let rec = route(
            &state(RegimeKind::RangeBound, 0.8),
            RiskTolerance::Low,
            dec!(50_000),
            &RouterConfig::default(),
        );
        let err = build_entry_legs(&rec, &c, 100.0, RATE, now()).unwrap_err();
        assert!(matches!(err, EngineError::NoEntry(_)));
    }
}
