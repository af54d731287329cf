//! Expiration payoff of a multi-leg structure.
//!
//! The payoff is piecewise linear in the underlying price with kinks at the
//! strikes, so extremes and breakevens follow from the values at zero, at each
//! strike, and from the slope past the highest strike. Legs with different
//! expirations are evaluated as if they all expire together.

use options_guard_gateway::OptionRight;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::Leg;

/// A dollar amount that may be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "amount", rename_all = "snake_case")]
pub enum LossBound {
    Bounded(Decimal),
    Unbounded,
}

impl LossBound {
    #[must_use]
    pub fn bounded(&self) -> Option<Decimal> {
        match self {
            Self::Bounded(v) => Some(*v),
            Self::Unbounded => None,
        }
    }

    /// Scales a bounded amount; unbounded stays unbounded.
    #[must_use]
    pub fn scale(&self, factor: Decimal) -> Self {
        match self {
            Self::Bounded(v) => Self::Bounded(*v * factor),
            Self::Unbounded => Self::Unbounded,
        }
    }
}

impl Ord for LossBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bounded(a), Self::Bounded(b)) => a.cmp(b),
            (Self::Bounded(_), Self::Unbounded) => Ordering::Less,
            (Self::Unbounded, Self::Bounded(_)) => Ordering::Greater,
            (Self::Unbounded, Self::Unbounded) => Ordering::Equal,
        }
    }
}

impl PartialOrd for LossBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for LossBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded(v) => write!(f, "${}", v.round_dp(2)),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

#[derive(Debug, Clone)]
struct PayoffLeg {
    strike: Decimal,
    right: OptionRight,
    quantity: Decimal,
    premium: Decimal,
}

/// Expiration P&L of one structure unit, in dollars.
#[derive(Debug, Clone)]
pub struct PayoffProfile {
    legs: Vec<PayoffLeg>,
    multiplier: Decimal,
}

impl PayoffProfile {
    #[must_use]
    pub fn new(legs: &[Leg], multiplier: Decimal) -> Self {
        Self {
            legs: legs
                .iter()
                .map(|l| PayoffLeg {
                    strike: l.contract.strike,
                    right: l.contract.right,
                    quantity: Decimal::from(l.quantity),
                    premium: l.entry_price,
                })
                .collect(),
            multiplier,
        }
    }

    /// P&L at expiration with the underlying at `price`, premiums included.
    #[must_use]
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.legs
            .iter()
            .map(|l| {
                let intrinsic = match l.right {
                    OptionRight::Call => (price - l.strike).max(Decimal::ZERO),
                    OptionRight::Put => (l.strike - price).max(Decimal::ZERO),
                };
                l.quantity * (intrinsic - l.premium)
            })
            .sum::<Decimal>()
            * self.multiplier
    }

    /// Dollars per $1 move above the highest strike.
    fn right_slope(&self) -> Decimal {
        self.legs
            .iter()
            .filter(|l| l.right == OptionRight::Call)
            .map(|l| l.quantity)
            .sum::<Decimal>()
            * self.multiplier
    }

    fn kinks(&self) -> Vec<Decimal> {
        let mut xs: Vec<Decimal> = std::iter::once(Decimal::ZERO)
            .chain(self.legs.iter().map(|l| l.strike))
            .collect();
        xs.sort();
        xs.dedup();
        xs
    }

    /// Largest loss as a positive amount.
    #[must_use]
    pub fn max_loss(&self) -> LossBound {
        if self.right_slope() < Decimal::ZERO {
            return LossBound::Unbounded;
        }
        let worst = self
            .kinks()
            .into_iter()
            .map(|x| self.value_at(x))
            .min()
            .unwrap_or(Decimal::ZERO);
        LossBound::Bounded((-worst).max(Decimal::ZERO))
    }

    #[must_use]
    pub fn max_gain(&self) -> LossBound {
        if self.right_slope() > Decimal::ZERO {
            return LossBound::Unbounded;
        }
        let best = self
            .kinks()
            .into_iter()
            .map(|x| self.value_at(x))
            .max()
            .unwrap_or(Decimal::ZERO);
        LossBound::Bounded(best.max(Decimal::ZERO))
    }

    /// Prices where the expiration P&L crosses zero, ascending.
    #[must_use]
    pub fn breakevens(&self) -> Vec<Decimal> {
        let xs = self.kinks();
        let vs: Vec<Decimal> = xs.iter().map(|x| self.value_at(*x)).collect();
        let mut out = Vec::new();

        for i in 0..xs.len() {
            if vs[i].is_zero() && !xs[i].is_zero() {
                out.push(xs[i]);
            }
            if i + 1 < xs.len() {
                let (v0, v1) = (vs[i], vs[i + 1]);
                if (v0 < Decimal::ZERO && v1 > Decimal::ZERO)
                    || (v0 > Decimal::ZERO && v1 < Decimal::ZERO)
                {
                    let x = xs[i] + (-v0) * (xs[i + 1] - xs[i]) / (v1 - v0);
                    out.push(x);
                }
            }
        }

        if let (Some(&x_last), Some(&v_last)) = (xs.last(), vs.last()) {
            let slope = self.right_slope();
            if (v_last < Decimal::ZERO && slope > Decimal::ZERO)
                || (v_last > Decimal::ZERO && slope < Decimal::ZERO)
            {
                out.push(x_last - v_last / slope);
            }
        }

        out.sort();
        out.dedup();
        out
    }

    /// Price intervals with positive P&L at expiration. An open upper end is `None`.
    #[must_use]
    pub fn profitable_intervals(&self) -> Vec<(Decimal, Option<Decimal>)> {
        let breakevens = self.breakevens();
        let far = self
            .kinks()
            .into_iter()
            .chain(breakevens.iter().copied())
            .max()
            .unwrap_or(Decimal::ZERO)
            + Decimal::ONE;

        let mut bounds: Vec<Decimal> = vec![Decimal::ZERO];
        bounds.extend(breakevens.iter().copied());

        let mut out = Vec::new();
        for (i, lo) in bounds.iter().enumerate() {
            let hi = bounds.get(i + 1).copied();
            let probe = match hi {
                Some(hi) => (*lo + hi) / Decimal::TWO,
                None => far,
            };
            if self.value_at(probe) > Decimal::ZERO {
                out.push((*lo, hi));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use options_guard_gateway::OptionsContract;
    use rust_decimal_macros::dec;

    fn leg(strike: Decimal, right: OptionRight, qty: i32, price: Decimal) -> Leg {
        Leg::new(
            OptionsContract::new(
                "SPY",
                NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
                strike,
                right,
            ),
            qty,
            price,
        )
    }

    #[test]
    fn bull_put_spread() {
        let legs = vec![
            leg(dec!(445), OptionRight::Put, -1, dec!(3.00)),
            leg(dec!(440), OptionRight::Put, 1, dec!(1.50)),
        ];
        let p = PayoffProfile::new(&legs, dec!(100));
        assert_eq!(p.max_loss(), LossBound::Bounded(dec!(350)));
        assert_eq!(p.max_gain(), LossBound::Bounded(dec!(150)));
        assert_eq!(p.breakevens(), vec![dec!(443.5)]);
        assert_eq!(p.profitable_intervals(), vec![(dec!(443.5), None)]);
    }

    #[test]
    fn long_call_has_unbounded_gain() {
        let p = PayoffProfile::new(&[leg(dec!(100), OptionRight::Call, 1, dec!(2.50))], dec!(100));
        assert_eq!(p.max_loss(), LossBound::Bounded(dec!(250)));
        assert_eq!(p.max_gain(), LossBound::Unbounded);
        assert_eq!(p.breakevens(), vec![dec!(102.5)]);
    }

    #[test]
    fn naked_short_call_has_unbounded_loss() {
        let p = PayoffProfile::new(&[leg(dec!(100), OptionRight::Call, -1, dec!(2.50))], dec!(100));
        assert_eq!(p.max_loss(), LossBound::Unbounded);
        assert_eq!(p.max_gain(), LossBound::Bounded(dec!(250)));
    }

    #[test]
    fn iron_condor_has_two_breakevens() {
        let legs = vec![
            leg(dec!(90), OptionRight::Put, 1, dec!(0.50)),
            leg(dec!(95), OptionRight::Put, -1, dec!(1.50)),
            leg(dec!(105), OptionRight::Call, -1, dec!(1.50)),
            leg(dec!(110), OptionRight::Call, 1, dec!(0.50)),
        ];
        let p = PayoffProfile::new(&legs, dec!(100));
        assert_eq!(p.max_gain(), LossBound::Bounded(dec!(200)));
        assert_eq!(p.max_loss(), LossBound::Bounded(dec!(300)));
        assert_eq!(p.breakevens(), vec![dec!(93), dec!(107)]);
        assert_eq!(p.profitable_intervals(), vec![(dec!(93), Some(dec!(107)))]);
    }

    #[test]
    fn bounded_orders_before_unbounded() {
        assert!(LossBound::Bounded(dec!(1_000_000)) < LossBound::Unbounded);
        assert!(LossBound::Bounded(dec!(100)) < LossBound::Bounded(dec!(200)));
        assert_eq!(LossBound::Bounded(dec!(3)).scale(dec!(2)), LossBound::Bounded(dec!(6)));
    }
}
