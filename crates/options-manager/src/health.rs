//! Position health checks.
//!
//! A pass runs four checks per position: data staleness, bid/ask spread
//! width, Greek drift from the entry target, and portfolio coherence. The
//! overall status is the worst of the four. Any failure to evaluate is
//! reported as a Red data issue rather than an error.

use chrono::{DateTime, Utc};
use options_guard_core::HealthConfig;
use options_guard_gateway::{OptionsChain, StockQuote};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StaleDataError;
use crate::greeks;
use crate::types::{
    CheckKind, CheckResult, GreeksSnapshot, HealthCheckResult, HealthStatus, Position, PositionId,
};

/// Staleness check over the quote and the chain.
#[must_use]
pub fn check_staleness(
    ticker: &str,
    quote: Option<&StockQuote>,
    chain: Option<&OptionsChain>,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> CheckResult {
    let (Some(quote), Some(chain)) = (quote, chain) else {
        return CheckResult::data_issue(
            CheckKind::Staleness,
            format!("no market data for {ticker}"),
        );
    };

    let age = quote.age_secs(now).max(chain.age_secs(now));
    if age > config.staleness_secs {
        let err = StaleDataError {
            symbol: ticker.to_string(),
            age_secs: age,
            limit_secs: config.staleness_secs,
        };
        let mut result = CheckResult::data_issue(CheckKind::Staleness, err.to_string());
        result.value = Some(age as f64);
        return result;
    }
    CheckResult::pass(CheckKind::Staleness, Some(age as f64), format!("data {age}s old"))
}

/// Widest leg spread as a fraction of mid.
#[must_use]
pub fn check_spreads(position: &Position, chain: Option<&OptionsChain>, config: &HealthConfig) -> CheckResult {
    let Some(chain) = chain else {
        return CheckResult::data_issue(CheckKind::SpreadWidth, "no option chain");
    };

    let mut widest: Option<(f64, String)> = None;
    for leg in &position.legs {
        let c = &leg.contract;
        let Some(quote) = chain.find(c.expiry, c.strike, c.right) else {
            return CheckResult::data_issue(
                CheckKind::SpreadWidth,
                format!("no quote for {}", c.display_name()),
            );
        };
        let Some(pct) = quote.spread_pct() else {
            return CheckResult::data_issue(
                CheckKind::SpreadWidth,
                format!("no two-sided market for {}", c.display_name()),
            );
        };
        if widest.as_ref().map_or(true, |(w, _)| pct > *w) {
            widest = Some((pct, c.display_name()));
        }
    }

    match widest {
        Some((pct, name)) if pct > config.max_spread_pct => CheckResult::fail(
            CheckKind::SpreadWidth,
            HealthStatus::Yellow,
            Some(pct),
            format!("{name} spread {:.1}% of mid", pct * 100.0),
        ),
        Some((pct, _)) => CheckResult::pass(
            CheckKind::SpreadWidth,
            Some(pct),
            format!("widest spread {:.1}% of mid", pct * 100.0),
        ),
        None => CheckResult::pass(CheckKind::SpreadWidth, None, "no legs"),
    }
}

/// Band classification of |delta - target|.
#[must_use]
pub fn drift_status(drift: f64, config: &HealthConfig) -> HealthStatus {
    if drift <= config.yellow_band {
        HealthStatus::Green
    } else if drift <= config.red_band {
        HealthStatus::Yellow
    } else {
        HealthStatus::Red
    }
}

/// Recomputes Greeks and checks drift. A pricing error yields a Red data
/// issue and no snapshot.
#[must_use]
pub fn check_drift(
    position: &Position,
    quote: Option<&StockQuote>,
    chain: Option<&OptionsChain>,
    rate: f64,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> (CheckResult, Option<GreeksSnapshot>) {
    let (Some(quote), Some(chain)) = (quote, chain) else {
        return (
            CheckResult::data_issue(CheckKind::GreekDrift, "no market data to price Greeks"),
            None,
        );
    };
    let Some(spot) = quote.price().to_f64() else {
        return (CheckResult::data_issue(CheckKind::GreekDrift, "unusable spot price"), None);
    };

    match greeks::position_greeks(&position.legs, spot, chain, rate, now) {
        Ok(snapshot) => {
            let drift = (snapshot.delta - position.target_delta).abs();
            let status = drift_status(drift, config);
            let detail = format!(
                "delta {:+.3} vs target {:+.3} (drift {:.3})",
                snapshot.delta, position.target_delta, drift
            );
            let result = if status == HealthStatus::Green {
                CheckResult::pass(CheckKind::GreekDrift, Some(drift), detail)
            } else {
                CheckResult::fail(CheckKind::GreekDrift, status, Some(drift), detail)
            };
            (result, Some(snapshot))
        }
        Err(e) => {
            warn!(position_id = %position.id, error = %e, "Greeks rejected inputs");
            (CheckResult::data_issue(CheckKind::GreekDrift, e.to_string()), None)
        }
    }
}

/// Position-local part of a health pass.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub checks: Vec<CheckResult>,
    pub snapshot: Option<GreeksSnapshot>,
    pub drift: Option<f64>,
}

/// Runs staleness, spread and drift checks for one position.
#[must_use]
pub fn assess(
    position: &Position,
    quote: Option<&StockQuote>,
    chain: Option<&OptionsChain>,
    rate: f64,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> Assessment {
    let staleness = check_staleness(&position.ticker, quote, chain, now, config);
    let spreads = check_spreads(position, chain, config);
    let (drift_check, snapshot) = check_drift(position, quote, chain, rate, now, config);
    let drift = snapshot.as_ref().map(|s| (s.delta - position.target_delta).abs());

    Assessment {
        checks: vec![staleness, spreads, drift_check],
        snapshot,
        drift,
    }
}

/// Combines the local checks with the coherence check; overall is the worst.
#[must_use]
pub fn finalize(
    position_id: PositionId,
    assessment: Assessment,
    coherence: CheckResult,
    now: DateTime<Utc>,
) -> HealthCheckResult {
    let mut checks = assessment.checks;
    checks.push(coherence);
    let status = checks
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Unchecked);
    let data_issue = checks.iter().any(|c| c.data_issue);

    debug!(%position_id, %status, data_issue, drift = ?assessment.drift, "Health evaluated");

    HealthCheckResult {
        position_id,
        status,
        checks,
        data_issue,
        drift: assessment.drift,
        checked_at: now,
    }
}

/// Debounce state for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    pub last_status: HealthStatus,
    /// Set when the last plan was rejected, expired or failed.
    pub rearmed: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            last_status: HealthStatus::Unchecked,
            rearmed: false,
        }
    }
}

impl MonitorState {
    /// Records a status. Returns true when it should trigger a repair search
    /// and an alert: a new breach status, or any breach after re-arming.
    pub fn observe(&mut self, status: HealthStatus) -> bool {
        let changed = status != self.last_status;
        self.last_status = status;
        if !status.is_breach() {
            return false;
        }
        if changed || self.rearmed {
            self.rearmed = false;
            return true;
        }
        false
    }

    pub fn rearm(&mut self) {
        self.rearmed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{chain, expiry, now, quote, RATE};
    use crate::types::{Leg, StrategyType};
    use chrono::Duration;
    use options_guard_gateway::{OptionRight, OptionsContract};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn spot_quote(price: Decimal, at: DateTime<Utc>) -> StockQuote {
        StockQuote {
            symbol: "SPY".to_string(),
            bid: price - dec!(0.01),
            ask: price + dec!(0.01),
            last: price,
            volume: 1_000_000,
            timestamp: at,
        }
    }

    fn bull_put(target_delta: f64) -> Position {
        let legs = vec![
            Leg::new(OptionsContract::new("SPY", expiry(30), dec!(98), OptionRight::Put), -1, dec!(1.90)),
            Leg::new(OptionsContract::new("SPY", expiry(30), dec!(95), OptionRight::Put), 1, dec!(1.00)),
        ];
        Position::new("u1", "SPY", StrategyType::BullPutSpread, legs, 2, target_delta, now())
    }

    // ============================================
    // Individual Checks
    // ============================================

    #[test]
    fn missing_quote_is_red_data_issue() {
        let c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        let r = check_staleness("SPY", None, Some(&c), now(), &HealthConfig::default());
        assert_eq!(r.status, HealthStatus::Red);
        assert!(r.data_issue);
    }

    #[test]
    fn old_quote_is_stale() {
        let c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        let q = spot_quote(dec!(100), now() - Duration::seconds(600));
        let r = check_staleness("SPY", Some(&q), Some(&c), now(), &HealthConfig::default());
        assert!(r.data_issue);
        assert!(r.detail.contains("stale"));
        assert_eq!(r.value, Some(600.0));
    }

    #[test]
    fn wide_spread_is_yellow() {
        let mut c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        for q in &mut c.quotes {
            if q.contract.strike == dec!(95) && q.contract.right == OptionRight::Put {
                q.bid = dec!(0.50);
                q.ask = dec!(1.50);
            }
        }
        let r = check_spreads(&bull_put(0.1), Some(&c), &HealthConfig::default());
        assert_eq!(r.status, HealthStatus::Yellow);
        assert!(!r.data_issue);
    }

    #[test]
    fn missing_leg_quote_is_data_issue() {
        let c = chain("SPY", dec!(100), dec!(1), 0.2, &[45]);
        let r = check_spreads(&bull_put(0.1), Some(&c), &HealthConfig::default());
        assert_eq!(r.status, HealthStatus::Red);
        assert!(r.data_issue);
    }

    #[test]
    fn drift_bands() {
        let config = HealthConfig::default();
        assert_eq!(drift_status(0.05, &config), HealthStatus::Green);
        assert_eq!(drift_status(0.10, &config), HealthStatus::Green);
        assert_eq!(drift_status(0.12, &config), HealthStatus::Yellow);
        assert_eq!(drift_status(0.25, &config), HealthStatus::Red);
    }

    #[test]
    fn zero_iv_yields_data_issue_without_snapshot() {
        let mut c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        for q in &mut c.quotes {
            q.iv = 0.0;
        }
        let q = spot_quote(dec!(100), now());
        let (r, snap) = check_drift(&bull_put(0.1), Some(&q), Some(&c), RATE, now(), &HealthConfig::default());
        assert!(snap.is_none());
        assert!(r.data_issue);
        assert_eq!(r.status, HealthStatus::Red);
    }

    // ============================================
    // Overall Status
    // ============================================

    #[test]
    fn overall_is_worst_check() {
        let c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        let q = spot_quote(dec!(100), now());
        let position = bull_put(0.0);
        let assessment = assess(&position, Some(&q), Some(&c), RATE, now(), &HealthConfig::default());
        let snapshot_delta = assessment.snapshot.as_ref().unwrap().delta;

        let coherence = CheckResult::fail(CheckKind::PortfolioCoherence, HealthStatus::Yellow, Some(1.2), "over");
        let result = finalize(position.id, assessment, coherence, now());
        assert_eq!(result.checks.len(), 4);
        assert!(result.status >= HealthStatus::Yellow);
        assert!((result.drift.unwrap() - snapshot_delta.abs()).abs() < 1e-12);
    }

    #[test]
    fn identical_checks_are_idempotent() {
        let c = chain("SPY", dec!(100), dec!(1), 0.2, &[30]);
        let q = spot_quote(dec!(100), now());
        let position = bull_put(0.1);
        let config = HealthConfig::default();
        let a = assess(&position, Some(&q), Some(&c), RATE, now(), &config);
        let b = assess(&position, Some(&q), Some(&c), RATE, now(), &config);
        assert_eq!(a.checks, b.checks);
        assert_eq!(a.snapshot, b.snapshot);
    }

    #[test]
    fn priced_leg_quote_fixture_is_tight() {
        let q = quote("SPY", 100.0, dec!(98), OptionRight::Put, 30, 0.2);
        assert!(q.spread_pct().unwrap() < HealthConfig::default().max_spread_pct);
    }

    // ============================================
    // Debounce
    // ============================================

    #[test]
    fn breach_triggers_once_per_transition() {
        let mut state = MonitorState::default();
        assert!(!state.observe(HealthStatus::Green));
        assert!(state.observe(HealthStatus::Red));
        assert!(!state.observe(HealthStatus::Red));
        assert!(!state.observe(HealthStatus::Red));
        assert!(state.observe(HealthStatus::Yellow));
        assert!(!state.observe(HealthStatus::Green));
        assert!(state.observe(HealthStatus::Yellow));
    }

    #[test]
    fn rearm_allows_retrigger_at_same_status() {
        let mut state = MonitorState::default();
        assert!(state.observe(HealthStatus::Red));
        state.rearm();
        assert!(state.observe(HealthStatus::Red));
        assert!(!state.observe(HealthStatus::Red));
    }
}
