use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Every threshold the engine acts on lives here so it can be tuned per
/// deployment (and hot-reloaded through [`crate::ConfigWatcher`]) instead of
/// being compiled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub pricing: PricingConfig,
    pub regime: RegimeConfig,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub repair: RepairConfig,
    pub sizing: SizingConfig,
    pub alerts: AlertConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Socket address string for the HTTP listener.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Audit database. Persistence is disabled when `url` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Cadence of the background tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Regime detector cadence (seconds).
    pub regime_interval_secs: u64,
    /// Health monitor pass cadence (seconds).
    pub health_interval_secs: u64,
    /// Flush cadence for batched low-priority alerts (seconds).
    pub alert_flush_interval_secs: u64,
    /// Cadence of the sweep that expires plans past their validity window (seconds).
    pub plan_sweep_interval_secs: u64,
    /// Capacity of the evaluation job queue.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            regime_interval_secs: 300,
            health_interval_secs: 60,
            alert_flush_interval_secs: 300,
            plan_sweep_interval_secs: 30,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Continuously compounded risk-free rate (0.045 = 4.5%).
    pub risk_free_rate: f64,
    /// Shares per contract.
    pub contract_multiplier: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.045,
            contract_multiplier: Decimal::from(100),
        }
    }
}

/// Regime classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Ticker whose signal window drives the global regime.
    pub benchmark: String,
    /// Bars required before the window is trusted.
    pub min_bars: usize,
    /// Consecutive evaluations a statistical regime must repeat before it activates.
    pub confirmation_passes: u32,
    /// Distance from SMA-20 (fraction of price) that counts as trending.
    pub trend_threshold: f64,
    /// Distance from SMA-20 under which price is considered range bound.
    pub range_threshold: f64,
    /// Realized-vol z-score that marks volatile chop.
    pub chop_rv_z: f64,
    /// IV rank at or above which range-bound markets favor selling premium.
    pub iv_rank_high: f64,
    /// Earnings within this many days puts the market in an earnings window.
    pub earnings_window_days: i64,
    /// Macro events within this many hours put the market in a macro-event regime.
    pub macro_window_hours: i64,
    /// Implied/realized vol above this is treated as corrupt data.
    pub max_sane_vol: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            benchmark: "SPY".to_string(),
            min_bars: 30,
            confirmation_passes: 3,
            trend_threshold: 0.02,
            range_threshold: 0.015,
            chop_rv_z: 1.0,
            iv_rank_high: 0.7,
            earnings_window_days: 5,
            macro_window_hours: 24,
            max_sane_vol: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Regimes reported below this confidence route to the conservative default.
    pub min_confidence: f64,
    /// Accounts below this equity are routed as low risk tolerance.
    pub small_account_equity: Decimal,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.4,
            small_account_equity: Decimal::from(10_000),
        }
    }
}

/// Health monitor tolerance bands and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Market data older than this fails the staleness check.
    pub staleness_secs: i64,
    /// Leg bid/ask spread above this fraction of mid fails the spread check.
    pub max_spread_pct: f64,
    /// |delta - target| at or below this is Green.
    pub yellow_band: f64,
    /// |delta - target| above this is Red; between the bands is Yellow.
    pub red_band: f64,
    /// Aggregate share-equivalent delta allowed per account.
    pub max_portfolio_delta: f64,
    /// Aggregate dollar vega (per vol point) allowed per account.
    pub max_portfolio_vega: f64,
    /// Portfolio limits breached by more than this multiple turn Red.
    pub hard_limit_multiple: f64,
    /// Greeks snapshots kept per position.
    pub greeks_history_len: usize,
    /// Health results kept per position.
    pub health_history_len: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 120,
            max_spread_pct: 0.15,
            yellow_band: 0.10,
            red_band: 0.15,
            max_portfolio_delta: 500.0,
            max_portfolio_vega: 1500.0,
            hard_limit_multiple: 1.5,
            greeks_history_len: 5,
            health_history_len: 288,
        }
    }
}

/// Hedge search window and plan policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Strikes within this fraction of spot are considered.
    pub strike_window_pct: f64,
    pub min_dte: i64,
    pub max_dte: i64,
    /// Widest spread searched, in listed strike steps.
    pub max_width_steps: usize,
    /// Largest hedge size, in multiples of the position's units.
    pub max_hedge_ratio: u32,
    /// Validity window of a freshly priced plan.
    pub plan_ttl_secs: i64,
    /// Drift at or beyond `red_band * critical_drift_multiple` is Critical.
    pub critical_drift_multiple: f64,
    /// Unrealized loss at or above this fraction of equity escalates priority.
    pub loss_escalation_pct: f64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            strike_window_pct: 0.10,
            min_dte: 7,
            max_dte: 60,
            max_width_steps: 3,
            max_hedge_ratio: 2,
            plan_ttl_secs: 900,
            critical_drift_multiple: 1.5,
            loss_escalation_pct: 0.10,
        }
    }
}

/// Fractional Kelly parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Fraction of full Kelly applied (0.25 = quarter Kelly).
    pub kelly_multiplier: f64,
    /// Largest fraction of equity any single trade may risk.
    pub max_equity_fraction: f64,
    /// Absolute dollar max loss per trade.
    pub max_loss_per_trade: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.25,
            max_equity_fraction: 0.05,
            max_loss_per_trade: Decimal::from(2000),
        }
    }
}

impl SizingConfig {
    /// Builds the sizer described by this section.
    #[must_use]
    pub fn sizer(&self) -> crate::kelly::RiskSizer {
        crate::kelly::RiskSizer::new(
            self.kelly_multiplier,
            self.max_equity_fraction,
            self.max_loss_per_trade,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Width of the de-duplication time bucket (seconds).
    pub dedupe_bucket_secs: i64,
    /// Delivery attempts per channel after the first one.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedupe_bucket_secs: 900,
            max_retries: 3,
            retry_base_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout for each leg submission; a timeout counts as a failed leg.
    pub leg_timeout_ms: u64,
    /// Plans priced against an underlying that has since moved more than this fraction are stale.
    pub max_underlying_move_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_timeout_ms: 5_000,
            max_underlying_move_pct: 0.02,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_order_the_bands() {
        let config = AppConfig::default();
        assert!(config.health.yellow_band < config.health.red_band);
        assert!(config.repair.min_dte < config.repair.max_dte);
        assert_eq!(config.server.addr(), "0.0.0.0:8080");
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"health": {"red_band": 0.2}}"#).unwrap();
        assert!((config.health.red_band - 0.2).abs() < f64::EPSILON);
        assert!((config.health.yellow_band - 0.10).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.health_interval_secs, 60);
    }
}
