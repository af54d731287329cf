//! Fractional Kelly position sizing for defined-risk option structures.
//!
//! Sizes a trade in structure units (contracts) from a win probability and a
//! win/loss payoff ratio, bounded by an equity fraction and an absolute
//! max-loss-per-trade ceiling.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fractional Kelly sizer for options trades.
///
/// The Kelly fraction for a bet that wins `b` per unit risked with
/// probability `p` is:
/// ```text
/// f* = p - (1 - p) / b
/// ```
///
/// `f*` is scaled by `kelly_multiplier`, clamped to `[0, max_equity_fraction]`,
/// turned into a dollar risk budget against equity and divided by the
/// per-contract max loss. The absolute ceiling is applied to the unit count
/// before it is narrowed to `u32`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSizer {
    /// Fraction of full Kelly to use (0.25 = quarter Kelly)
    pub kelly_multiplier: f64,
    /// Largest fraction of equity a single trade may risk
    pub max_equity_fraction: f64,
    /// Absolute dollar max loss per trade
    pub max_loss_per_trade: Decimal,
}

impl Default for RiskSizer {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.25,
            max_equity_fraction: 0.05,
            max_loss_per_trade: Decimal::new(2000, 0),
        }
    }
}

/// Result of a sizing calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeDecision {
    /// Recommended number of structure units
    pub contracts: u32,
    /// Dollar max loss of the recommended size
    pub max_loss: Decimal,
    /// Full Kelly fraction before scaling and clamping
    pub full_kelly: f64,
    /// Fraction of equity actually budgeted
    pub applied_fraction: f64,
    /// Dollar risk budget derived from the applied fraction
    pub risk_budget: Decimal,
    /// True when the absolute ceiling reduced the size
    pub capped: bool,
    pub reason: SizeReason,
}

impl SizeDecision {
    fn zero(full_kelly: f64, reason: SizeReason) -> Self {
        Self {
            contracts: 0,
            max_loss: Decimal::ZERO,
            full_kelly,
            applied_fraction: 0.0,
            risk_budget: Decimal::ZERO,
            capped: false,
            reason,
        }
    }

    /// Fraction of equity committed by the recommended size.
    #[must_use]
    pub fn equity_fraction(&self, equity: Decimal) -> f64 {
        if equity <= Decimal::ZERO {
            return 0.0;
        }
        (self.max_loss / equity).to_f64().unwrap_or(0.0)
    }
}

/// Why a size came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeReason {
    /// Positive expectancy, sized by fractional Kelly
    Sized,
    /// Kelly fraction was zero, negative or NaN
    NegativeExpectancy,
    /// Risk budget smaller than one contract's max loss
    BudgetBelowOneContract,
    /// Probability outside [0, 1], non-positive payoff, equity or per-contract loss
    InvalidInputs,
}

impl std::fmt::Display for SizeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sized => write!(f, "sized by fractional Kelly"),
            Self::NegativeExpectancy => write!(f, "negative expectancy"),
            Self::BudgetBelowOneContract => write!(f, "risk budget below one contract"),
            Self::InvalidInputs => write!(f, "invalid inputs"),
        }
    }
}

impl RiskSizer {
    #[must_use]
    pub fn new(kelly_multiplier: f64, max_equity_fraction: f64, max_loss_per_trade: Decimal) -> Self {
        Self {
            kelly_multiplier,
            max_equity_fraction,
            max_loss_per_trade,
        }
    }

    /// Full Kelly fraction `p - (1 - p) / b`.
    ///
    /// Returns NaN for a non-positive or non-finite payoff ratio.
    #[must_use]
    pub fn kelly_fraction(win_prob: f64, payoff_ratio: f64) -> f64 {
        if !payoff_ratio.is_finite() || payoff_ratio <= 0.0 {
            return f64::NAN;
        }
        win_prob - (1.0 - win_prob) / payoff_ratio
    }

    /// Sizes a trade in contracts.
    ///
    /// # Arguments
    /// * `win_prob` - Estimated probability of profit (0 to 1)
    /// * `payoff_ratio` - Average win divided by average loss
    /// * `equity` - Account equity
    /// * `max_loss_per_contract` - Dollar max loss of one structure unit
    ///
    /// # Examples
    /// ```
    /// use options_guard_core::kelly::RiskSizer;
    /// use rust_decimal_macros::dec;
    ///
    /// let sizer = RiskSizer::default();
    /// let decision = sizer.size(0.65, 1.0, dec!(100000), dec!(300));
    ///
    /// assert!(decision.contracts > 0);
    /// assert!(decision.max_loss <= dec!(2000));
    /// ```
    #[must_use]
    pub fn size(
        &self,
        win_prob: f64,
        payoff_ratio: f64,
        equity: Decimal,
        max_loss_per_contract: Decimal,
    ) -> SizeDecision {
        if !win_prob.is_finite()
            || !(0.0..=1.0).contains(&win_prob)
            || equity <= Decimal::ZERO
            || max_loss_per_contract <= Decimal::ZERO
        {
            return SizeDecision::zero(0.0, SizeReason::InvalidInputs);
        }

        let full_kelly = Self::kelly_fraction(win_prob, payoff_ratio);
        if full_kelly.is_nan() {
            if payoff_ratio.is_finite() && payoff_ratio <= 0.0 {
                return SizeDecision::zero(full_kelly, SizeReason::InvalidInputs);
            }
            return SizeDecision::zero(full_kelly, SizeReason::NegativeExpectancy);
        }
        if full_kelly <= 0.0 {
            return SizeDecision::zero(full_kelly, SizeReason::NegativeExpectancy);
        }

        let max_fraction = self.max_equity_fraction.max(0.0);
        let applied_fraction = (full_kelly * self.kelly_multiplier).clamp(0.0, max_fraction);
        let Some(fraction) = Decimal::from_f64(applied_fraction) else {
            return SizeDecision::zero(full_kelly, SizeReason::InvalidInputs);
        };
        let risk_budget = (equity * fraction).round_dp(2);

        let mut units = (risk_budget / max_loss_per_contract).floor();
        let mut capped = false;
        let ceiling = self.max_loss_per_trade.max(Decimal::ZERO);
        if units * max_loss_per_contract > ceiling {
            units = (ceiling / max_loss_per_contract).floor();
            capped = true;
        }
        let contracts = units.to_u32().unwrap_or(u32::MAX);

        if contracts == 0 {
            return SizeDecision {
                contracts: 0,
                max_loss: Decimal::ZERO,
                full_kelly,
                applied_fraction,
                risk_budget,
                capped,
                reason: SizeReason::BudgetBelowOneContract,
            };
        }

        SizeDecision {
            contracts,
            max_loss: Decimal::from(contracts) * max_loss_per_contract,
            full_kelly,
            applied_fraction,
            risk_budget,
            capped,
            reason: SizeReason::Sized,
        }
    }
}
