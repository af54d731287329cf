//! Fractional-Kelly position size for a trade described on the command line.

use anyhow::Result;
use clap::Args;
use options_guard_core::{RiskSizer, SizeDecision};
use rust_decimal::Decimal;

/// Arguments for the size command.
#[derive(Args, Debug, Clone)]
pub struct SizeArgs {
    /// Probability of profit (0 to 1)
    #[arg(long)]
    pub win_prob: f64,

    /// Average win divided by average loss
    #[arg(long)]
    pub payoff_ratio: f64,

    /// Account equity in dollars
    #[arg(long)]
    pub equity: Decimal,

    /// Dollar max loss of one structure unit
    #[arg(long)]
    pub max_loss_per_contract: Decimal,

    /// Override the configured fractional-Kelly multiplier
    #[arg(long)]
    pub kelly_multiplier: Option<f64>,

    /// Override the configured maximum equity fraction
    #[arg(long)]
    pub max_equity_fraction: Option<f64>,

    /// Override the configured max loss per trade
    #[arg(long)]
    pub max_loss_per_trade: Option<Decimal>,

    /// Print the decision as JSON
    #[arg(long)]
    pub json: bool,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

/// Runs the size command.
///
/// # Errors
/// Returns an error if configuration cannot be loaded.
pub fn run_size(args: SizeArgs) -> Result<()> {
    let config = super::load_config(&args.config, None)?;
    let sizer = sizer(&args, config.sizing.sizer());
    let decision = sizer.size(
        args.win_prob,
        args.payoff_ratio,
        args.equity,
        args.max_loss_per_contract,
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        print!("{}", format_decision(&decision, args.equity));
    }
    Ok(())
}

fn sizer(args: &SizeArgs, configured: RiskSizer) -> RiskSizer {
    RiskSizer::new(
        args.kelly_multiplier.unwrap_or(configured.kelly_multiplier),
        args.max_equity_fraction.unwrap_or(configured.max_equity_fraction),
        args.max_loss_per_trade.unwrap_or(configured.max_loss_per_trade),
    )
}

fn format_decision(d: &SizeDecision, equity: Decimal) -> String {
    let mut out = format!(
        "contracts        {}\n\
         max loss         ${}\n\
         equity at risk   {:.2}%\n\
         full kelly       {:.4}\n\
         applied fraction {:.4}\n\
         risk budget      ${}\n\
         reason           {}\n",
        d.contracts,
        d.max_loss.round_dp(2),
        d.equity_fraction(equity) * 100.0,
        d.full_kelly,
        d.applied_fraction,
        d.risk_budget.round_dp(2),
        d.reason,
    );
    if d.capped {
        out.push_str("capped by the max-loss-per-trade ceiling\n");
    }
    out
}
