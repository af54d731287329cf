//! Market regime classification.
//!
//! Rule/threshold classification over a rolling signal window. Every rule
//! that fires proposes a regime with a confidence in [0, 1]. A firing
//! event-driven regime wins outright; otherwise the most confident
//! proposal wins and ties go to the higher-priority regime.
//! Statistical regimes must repeat for `confirmation_passes` evaluations
//! before they replace the active one; event-driven regimes and volatile
//! chop switch immediately.

use chrono::{DateTime, Utc};
use options_guard_core::RegimeConfig;
use options_guard_gateway::{EventCalendar, PriceBar, SignalWindow};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SMA_PERIOD: usize = 20;
const SLOPE_LAG: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeKind {
    TrendingUp,
    TrendingDown,
    RangeBound,
    HighVolatilityChop,
    EarningsWindow,
    MacroEvent,
    Normal,
}

impl RegimeKind {
    /// Tie-break rank; higher wins.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::MacroEvent => 6,
            Self::EarningsWindow => 5,
            Self::HighVolatilityChop => 4,
            Self::TrendingDown => 3,
            Self::TrendingUp => 2,
            Self::RangeBound => 1,
            Self::Normal => 0,
        }
    }

    #[must_use]
    pub fn is_event_driven(self) -> bool {
        matches!(self, Self::MacroEvent | Self::EarningsWindow)
    }

    /// Regimes that skip confirmation.
    #[must_use]
    pub fn switches_immediately(self) -> bool {
        self.is_event_driven() || self == Self::HighVolatilityChop
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::TrendingUp => "Sustained rally: bullish structures have the wind at their back.",
            Self::TrendingDown => "Downtrend confirmed: bearish structures favored, short puts at risk.",
            Self::RangeBound => "Range-bound tape: premium selling around the mean is favored.",
            Self::HighVolatilityChop => "Realized volatility spiking without direction: keep risk defined and small.",
            Self::EarningsWindow => "Earnings ahead: implied volatility will reprice on the print.",
            Self::MacroEvent => "Macro event imminent: expect gap risk across the tape.",
            Self::Normal => "No clear regime: default to conservative defined-risk structures.",
        }
    }
}

impl std::fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendingUp => write!(f, "TrendingUp"),
            Self::TrendingDown => write!(f, "TrendingDown"),
            Self::RangeBound => write!(f, "RangeBound"),
            Self::HighVolatilityChop => write!(f, "HighVolatilityChop"),
            Self::EarningsWindow => write!(f, "EarningsWindow"),
            Self::MacroEvent => write!(f, "MacroEvent"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

/// Span of the signal window a state was derived from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub bars: usize,
}

impl WindowInfo {
    fn of(window: &SignalWindow) -> Self {
        Self {
            start: window.start(),
            end: window.end(),
            bars: window.bars.len(),
        }
    }
}

/// Published regime classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: RegimeKind,
    pub confidence: f64,
    pub window: WindowInfo,
    pub is_shift: bool,
    pub description: String,
    pub computed_at: DateTime<Utc>,
}

impl RegimeState {
    /// State before the first evaluation.
    #[must_use]
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            regime: RegimeKind::Normal,
            confidence: 0.0,
            window: WindowInfo::default(),
            is_shift: false,
            description: RegimeKind::Normal.description().to_string(),
            computed_at: now,
        }
    }
}

/// Indicators derived from the window.
#[derive(Debug, Clone, PartialEq)]
pub struct Indicators {
    pub close: f64,
    pub sma20: f64,
    /// (close - SMA20) / close
    pub distance: f64,
    /// SMA20 now vs five bars ago
    pub slope: f64,
    pub return_5d: f64,
    pub iv_rank: f64,
    pub rv_z: f64,
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Computes indicators; `None` when there are too few bars.
#[must_use]
pub fn indicators(bars: &[PriceBar]) -> Option<Indicators> {
    if bars.len() < SMA_PERIOD + SLOPE_LAG {
        return None;
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close.to_f64().unwrap_or(0.0)).collect();
    let n = closes.len();
    let close = closes[n - 1];
    if close <= 0.0 {
        return None;
    }

    let sma20 = mean(&closes[n - SMA_PERIOD..]);
    let sma20_lagged = mean(&closes[n - SMA_PERIOD - SLOPE_LAG..n - SLOPE_LAG]);
    let slope = if sma20_lagged > 0.0 {
        sma20 / sma20_lagged - 1.0
    } else {
        0.0
    };
    let prior = closes[n - 1 - SLOPE_LAG];
    let return_5d = if prior > 0.0 { close / prior - 1.0 } else { 0.0 };

    let ivs: Vec<f64> = bars.iter().map(|b| b.implied_vol).collect();
    let iv = ivs[n - 1];
    let (iv_min, iv_max) = ivs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let iv_rank = if iv_max - iv_min > f64::EPSILON {
        ((iv - iv_min) / (iv_max - iv_min)).clamp(0.0, 1.0)
    } else {
        0.5
    };

    let rvs: Vec<f64> = bars[n - SMA_PERIOD..].iter().map(|b| b.realized_vol).collect();
    let rv_sd = std_dev(&rvs);
    let rv_z = if rv_sd > 1e-9 {
        (rvs[rvs.len() - 1] - mean(&rvs)) / rv_sd
    } else {
        0.0
    };

    Some(Indicators {
        close,
        sma20,
        distance: (close - sma20) / close,
        slope,
        return_5d,
        iv_rank,
        rv_z,
    })
}

/// Reason the window cannot be trusted, if any.
#[must_use]
pub fn data_quality_issue(window: &SignalWindow, config: &RegimeConfig) -> Option<String> {
    let needed = config.min_bars.max(SMA_PERIOD + SLOPE_LAG);
    if window.bars.len() < needed {
        return Some(format!("{} bars, need {needed}", window.bars.len()));
    }
    for bar in &window.bars {
        for (name, v) in [("implied vol", bar.implied_vol), ("realized vol", bar.realized_vol)] {
            if !v.is_finite() || v <= 0.0 {
                return Some(format!("{name} missing or zero at {}", bar.timestamp));
            }
            if v > config.max_sane_vol {
                return Some(format!("{name} {v:.2} above sanity limit at {}", bar.timestamp));
            }
        }
    }
    None
}

/// Every regime whose rule fires, with its confidence.
#[must_use]
pub fn candidates(
    ind: &Indicators,
    events: &EventCalendar,
    now: DateTime<Utc>,
    config: &RegimeConfig,
) -> Vec<(RegimeKind, f64)> {
    let mut out = vec![(RegimeKind::Normal, 0.4)];

    if let Some(at) = events.next_macro_event {
        let hours = (at - now).num_minutes() as f64 / 60.0;
        let window = config.macro_window_hours as f64;
        if hours >= 0.0 && hours <= window && window > 0.0 {
            out.push((RegimeKind::MacroEvent, 0.9 + 0.1 * (1.0 - hours / window)));
        }
    }

    if let Some(at) = events.next_earnings {
        let days = (at - now).num_hours() as f64 / 24.0;
        let window = config.earnings_window_days as f64;
        if days >= 0.0 && days <= window && window > 0.0 {
            out.push((RegimeKind::EarningsWindow, 0.8 + 0.15 * (1.0 - days / window)));
        }
    }

    let abs_dist = ind.distance.abs();

    if ind.rv_z >= config.chop_rv_z && abs_dist < config.trend_threshold {
        let conf = (0.55 + 0.15 * (ind.rv_z - config.chop_rv_z)).clamp(0.55, 0.95);
        out.push((RegimeKind::HighVolatilityChop, conf));
    }

    if ind.distance >= config.trend_threshold && ind.slope > 0.0 {
        let mut conf = 0.5 + 10.0 * (ind.distance - config.trend_threshold);
        if ind.return_5d > 0.0 {
            conf += 0.1;
        }
        out.push((RegimeKind::TrendingUp, conf.clamp(0.5, 0.95)));
    }

    if ind.distance <= -config.trend_threshold && ind.slope < 0.0 {
        let mut conf = 0.5 + 10.0 * (abs_dist - config.trend_threshold);
        if ind.return_5d < 0.0 {
            conf += 0.1;
        }
        out.push((RegimeKind::TrendingDown, conf.clamp(0.5, 0.95)));
    }

    if abs_dist < config.range_threshold && ind.rv_z < config.chop_rv_z {
        let mut conf = 0.5 + 0.2 * (1.0 - abs_dist / config.range_threshold);
        if ind.iv_rank >= config.iv_rank_high {
            conf += 0.1;
        }
        out.push((RegimeKind::RangeBound, conf.clamp(0.5, 0.9)));
    }

    out
}

/// Highest-priority event-driven regime if one fired, else highest
/// confidence with ties going to the higher-priority regime.
#[must_use]
pub fn pick(candidates: &[(RegimeKind, f64)]) -> (RegimeKind, f64) {
    let event = candidates
        .iter()
        .copied()
        .filter(|(kind, _)| kind.is_event_driven())
        .max_by_key(|(kind, _)| kind.priority());
    if let Some(event) = event {
        return event;
    }

    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.priority().cmp(&b.0.priority()))
        })
        .unwrap_or((RegimeKind::Normal, 0.0))
}

/// Stateful detector carrying the hysteresis counters.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    active: RegimeKind,
    active_confidence: f64,
    pending: Option<(RegimeKind, u32)>,
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self {
            active: RegimeKind::Normal,
            active_confidence: 0.0,
            pending: None,
        }
    }
}

impl RegimeDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn active(&self) -> RegimeKind {
        self.active
    }

    /// Classifies the window and applies hysteresis.
    pub fn evaluate(
        &mut self,
        window: &SignalWindow,
        now: DateTime<Utc>,
        config: &RegimeConfig,
    ) -> RegimeState {
        let info = WindowInfo::of(window);

        if let Some(issue) = data_quality_issue(window, config) {
            warn!(symbol = window.symbol, %issue, "Regime data quality gate failed");
            return RegimeState {
                regime: RegimeKind::Normal,
                confidence: 0.0,
                window: info,
                is_shift: false,
                description: format!("Insufficient data ({issue}). {}", RegimeKind::Normal.description()),
                computed_at: now,
            };
        }

        let Some(ind) = indicators(&window.bars) else {
            return RegimeState::initial(now);
        };
        let (candidate, confidence) = pick(&candidates(&ind, &window.events, now, config));
        debug!(
            symbol = window.symbol,
            %candidate,
            confidence,
            distance = ind.distance,
            rv_z = ind.rv_z,
            "Regime candidate"
        );

        let mut is_shift = false;
        if candidate == self.active {
            self.pending = None;
            self.active_confidence = confidence;
        } else {
            let count = match self.pending {
                Some((kind, n)) if kind == candidate => n + 1,
                _ => 1,
            };
            if candidate.switches_immediately() || count >= config.confirmation_passes.max(1) {
                info!(from = %self.active, to = %candidate, confidence, "Regime shift");
                self.active = candidate;
                self.active_confidence = confidence;
                self.pending = None;
                is_shift = true;
            } else {
                self.pending = Some((candidate, count));
            }
        }

        RegimeState {
            regime: self.active,
            confidence: self.active_confidence,
            window: info,
            is_shift,
            description: self.active.description().to_string(),
            computed_at: now,
        }
    }
}
