//! Portfolio-level Greek exposure and limit enforcement.
//!
//! Exposures are in share-equivalent delta and dollar vega: the unit Greek
//! times the position's units times the contract multiplier.

use options_guard_core::HealthConfig;
use options_guard_gateway::OptionsChain;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{CheckKind, CheckResult, GreeksSnapshot, HealthStatus, Position};

/// Aggregate exposure of one user's active positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioGreeks {
    pub user_id: String,
    pub positions: usize,
    /// Positions without a current snapshot; excluded from the sums.
    pub unpriced: usize,
    pub delta: f64,
    pub gamma: f64,
    /// Dollars per day.
    pub theta: f64,
    /// Dollars per vol point.
    pub vega: f64,
    pub rho: f64,
}

impl PortfolioGreeks {
    fn add(&mut self, unit: &GreeksSnapshot, scale: f64) {
        self.delta += unit.delta * scale;
        self.gamma += unit.gamma * scale;
        self.theta += unit.theta * scale;
        self.vega += unit.vega * scale;
        self.rho += unit.rho * scale;
    }
}

fn scale(contracts: u32, multiplier: Decimal) -> f64 {
    f64::from(contracts) * multiplier.to_f64().unwrap_or(100.0)
}

/// Sums the latest snapshots of active positions.
pub fn aggregate<'a>(
    user_id: &str,
    positions: impl IntoIterator<Item = &'a Position>,
    multiplier: Decimal,
) -> PortfolioGreeks {
    let mut out = PortfolioGreeks {
        user_id: user_id.to_string(),
        ..PortfolioGreeks::default()
    };
    for p in positions.into_iter().filter(|p| p.status.is_active()) {
        out.positions += 1;
        match &p.greeks {
            Some(g) => out.add(g, scale(p.contracts, multiplier)),
            None => out.unpriced += 1,
        }
    }
    out
}

/// Dollar P&L of the position at chain mids. `None` when a leg has no quote.
#[must_use]
pub fn unrealized_pnl(position: &Position, chain: &OptionsChain, multiplier: Decimal) -> Option<Decimal> {
    let mut per_unit = Decimal::ZERO;
    for leg in &position.legs {
        let c = &leg.contract;
        let quote = chain.find(c.expiry, c.strike, c.right)?;
        per_unit += Decimal::from(leg.quantity) * (quote.mid() - leg.entry_price);
    }
    Some(per_unit * Decimal::from(position.contracts) * multiplier)
}

/// Largest ratio of exposure to its limit.
#[must_use]
pub fn utilization(greeks: &PortfolioGreeks, config: &HealthConfig) -> f64 {
    let d = if config.max_portfolio_delta > 0.0 {
        greeks.delta.abs() / config.max_portfolio_delta
    } else {
        0.0
    };
    let v = if config.max_portfolio_vega > 0.0 {
        greeks.vega.abs() / config.max_portfolio_vega
    } else {
        0.0
    };
    d.max(v)
}

/// Portfolio coherence: Yellow beyond the limits, Red beyond the hard multiple.
#[must_use]
pub fn coherence_check(greeks: &PortfolioGreeks, config: &HealthConfig) -> CheckResult {
    let u = utilization(greeks, config);
    let detail = format!(
        "portfolio delta {:+.0} (limit {:.0}), vega {:+.0} (limit {:.0})",
        greeks.delta, config.max_portfolio_delta, greeks.vega, config.max_portfolio_vega
    );
    if u > config.hard_limit_multiple {
        CheckResult::fail(CheckKind::PortfolioCoherence, HealthStatus::Red, Some(u), detail)
    } else if u > 1.0 {
        CheckResult::fail(CheckKind::PortfolioCoherence, HealthStatus::Yellow, Some(u), detail)
    } else {
        CheckResult::pass(CheckKind::PortfolioCoherence, Some(u), detail)
    }
}

/// Result of checking a new position against the portfolio limits.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationCheck {
    Approved {
        max_units: u32,
        utilization_after: f64,
    },
    Rejected {
        utilization_now: f64,
        utilization_after_one: f64,
    },
}

/// Largest number of units of `unit` that keeps the portfolio within its
/// soft limits, capped at `requested`. A portfolio already over its limits
/// may add units that reduce utilization.
#[must_use]
pub fn check_allocation(
    current: &PortfolioGreeks,
    unit: &GreeksSnapshot,
    requested: u32,
    multiplier: Decimal,
    config: &HealthConfig,
) -> AllocationCheck {
    let with = |n: u32| {
        let mut g = current.clone();
        g.add(unit, scale(n, multiplier));
        utilization(&g, config)
    };

    let ceiling = utilization(current, config).max(1.0);
    let max_units = (1..=requested).take_while(|n| with(*n) <= ceiling).last();
    match max_units {
        Some(n) => AllocationCheck::Approved {
            max_units: n,
            utilization_after: with(n),
        },
        None => AllocationCheck::Rejected {
            utilization_now: utilization(current, config),
            utilization_after_one: with(1),
        },
    }
}
