//! Routes, sizes and explains an entry against the paper market without
//! submitting anything.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use options_guard_core::ConfigWatcher;
use options_guard_manager::types::{Account, EntryPlan, RiskTolerance};
use options_guard_manager::EngineApi;
use rust_decimal::Decimal;

use super::run::{open_market, start_engine};

const CLI_USER: &str = "cli";

/// Arguments for the explain command.
#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    /// Underlying to trade
    pub ticker: String,

    /// Account equity in dollars
    #[arg(long, default_value = "100000")]
    pub equity: Decimal,

    /// Risk tolerance (low, medium, high)
    #[arg(long, default_value = "medium")]
    pub risk: RiskTolerance,

    /// Synthetic paper market fixture
    #[arg(long, default_value = "demos/paper_market.json")]
    pub market: String,

    /// Recorded market snapshot; replaces the synthetic market when given
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Print the full entry plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

/// Runs the explain command.
///
/// # Errors
/// Returns an error if configuration or market data cannot be loaded, or
/// no entry fits (unbounded loss, sized to zero, portfolio limits).
pub async fn run_explain(args: ExplainArgs) -> Result<()> {
    let config = super::load_config(&args.config, None)?;
    let (feed, _source) = open_market(&args.market, args.snapshot.as_deref(), &config)?;

    let (_watcher, config_rx) = ConfigWatcher::new(config);
    let (service, _worker) = start_engine(config_rx, feed, None);
    let regime = service.context().refresh_regime(Utc::now()).await;
    tracing::debug!(regime = %regime.regime, confidence = regime.confidence, "Regime for explanation");

    let api = EngineApi::new(service);
    api.set_account(Account {
        user_id: CLI_USER.to_string(),
        equity: args.equity,
        risk_tolerance: args.risk,
    });
    let plan = api
        .recommend_entry(CLI_USER, &args.ticker)
        .await
        .with_context(|| format!("no entry for {}", args.ticker.to_uppercase()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", format_plan(&plan));
    }
    Ok(())
}

fn format_plan(plan: &EntryPlan) -> String {
    let e = &plan.explanation;
    let mut out = format!("{}\n\n", e.summary);
    out.push_str(&format!("{} x{} {}\n", plan.ticker, plan.contracts, plan.strategy));
    for leg in &plan.legs {
        let side = if leg.quantity >= 0 { "buy " } else { "sell" };
        out.push_str(&format!(
            "  {side} {:>2}  {}  @ {}\n",
            leg.quantity.unsigned_abs(),
            leg.contract.display_name(),
            leg.entry_price
        ));
    }
    out.push('\n');
    out.push_str(&format!(
        "probability of profit  {:.1}%\n",
        e.probability_of_profit * 100.0
    ));
    out.push_str(&format!(
        "max gain               {} ({} per unit)\n",
        e.max_gain_total, e.max_gain_per_unit
    ));
    out.push_str(&format!(
        "max loss               {} ({} per unit)\n",
        e.max_loss_total, e.max_loss_per_unit
    ));
    let breakevens: Vec<String> = e.breakevens.iter().map(|b| b.round_dp(2).to_string()).collect();
    out.push_str(&format!("breakevens             {}\n", breakevens.join(", ")));
    out.push_str(&format!(
        "equity at risk         {:.2}%\n\n",
        plan.equity_fraction * 100.0
    ));
    out.push_str(&format!("{}\n{}\n{}\n", e.greeks_line, e.economics_line, e.thesis_line));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper_market::PaperUniverse;
    use options_guard_core::AppConfig;
    use options_guard_gateway::PaperMarketData;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_plan_report_lists_legs_and_risk() {
        let universe: PaperUniverse = serde_json::from_str(
            r#"{
                "underlyings": [{
                    "symbol": "SPY",
                    "spot": "100",
                    "implied_vol": 0.25,
                    "realized_vol": 0.10,
                    "expiries_days": [35],
                    "strike_range_pct": 0.2
                }]
            }"#,
        )
        .unwrap();
        let config = AppConfig::default();
        let feed = PaperMarketData::new();
        universe
            .publish(&feed, config.pricing.risk_free_rate, Utc::now())
            .unwrap();

        let (_watcher, rx) = ConfigWatcher::new(config);
        let (service, _worker) = start_engine(rx, Arc::new(feed), None);
        let api = EngineApi::new(service);
        api.set_account(Account {
            user_id: CLI_USER.to_string(),
            equity: dec!(100000),
            risk_tolerance: RiskTolerance::Medium,
        });
        let plan = api.recommend_entry(CLI_USER, "SPY").await.unwrap();

        let text = format_plan(&plan);
        assert!(text.starts_with(&plan.explanation.summary));
        assert!(text.contains(&format!("SPY x{}", plan.contracts)));
        assert_eq!(text.matches("@ ").count(), plan.legs.len());
        assert!(text.contains("probability of profit"));
        assert!(text.contains(&plan.explanation.thesis_line));
    }
}
