//! One-shot Black-Scholes Greeks for a single contract.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, ValueEnum};
use options_guard_gateway::OptionRight;
use options_guard_manager::greeks;
use options_guard_manager::types::{GreeksSnapshot, PricingInputs};
use rust_decimal::prelude::ToPrimitive;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Right {
    Call,
    Put,
}

impl From<Right> for OptionRight {
    fn from(right: Right) -> Self {
        match right {
            Right::Call => Self::Call,
            Right::Put => Self::Put,
        }
    }
}

/// Arguments for the greeks command.
#[derive(Args, Debug, Clone)]
pub struct GreeksArgs {
    /// Underlying price
    #[arg(long)]
    pub spot: f64,

    /// Strike price
    #[arg(long)]
    pub strike: f64,

    /// Calendar days to expiration
    #[arg(long)]
    pub days: f64,

    /// Annualized implied volatility (0.20 = 20%)
    #[arg(long)]
    pub vol: f64,

    /// Option right
    #[arg(long, value_enum)]
    pub right: Right,

    /// Risk-free rate; defaults to the configured rate
    #[arg(long)]
    pub rate: Option<f64>,

    /// Contracts held (negative for short); scales the dollar line
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    pub quantity: i32,

    /// Print the snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

/// Runs the greeks command.
///
/// # Errors
/// Returns an error if configuration cannot be loaded or the inputs are
/// rejected (non-positive volatility, negative time, non-finite values).
pub fn run_greeks(args: GreeksArgs) -> Result<()> {
    let config = super::load_config(&args.config, None)?;
    let inputs = PricingInputs {
        spot: args.spot,
        strike: args.strike,
        days_to_expiry: args.days,
        volatility: args.vol,
        rate: args.rate.unwrap_or(config.pricing.risk_free_rate),
        right: args.right.into(),
    };
    let snapshot = greeks::calculate(&inputs, Utc::now()).context("invalid pricing inputs")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let multiplier = config.pricing.contract_multiplier.to_f64().unwrap_or(100.0);
        print!("{}", format_snapshot(&snapshot, f64::from(args.quantity) * multiplier));
    }
    Ok(())
}

/// Per-share Greeks followed by the dollar exposure of `shares` shares.
fn format_snapshot(s: &GreeksSnapshot, shares: f64) -> String {
    format!(
        "price  {:>10.4}\n\
         delta  {:>10.4}   ${:>10.2}\n\
         gamma  {:>10.4}   ${:>10.2}\n\
         theta  {:>10.4}   ${:>10.2} /day\n\
         vega   {:>10.4}   ${:>10.2} /vol pt\n\
         rho    {:>10.4}   ${:>10.2} /1% rate\n",
        s.price,
        s.delta,
        s.delta * shares,
        s.gamma,
        s.gamma * shares,
        s.theta,
        s.theta * shares,
        s.vega,
        s.vega * shares,
        s.rho,
        s.rho * shares,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_scales_dollar_column() {
        let snapshot = GreeksSnapshot {
            delta: -0.25,
            gamma: 0.01,
            theta: -0.05,
            vega: 0.2,
            rho: -0.1,
            price: 3.5,
            computed_at: Utc::now(),
            inputs: vec![],
        };
        let text = format_snapshot(&snapshot, -100.0);
        let delta_line = text.lines().nth(1).unwrap();
        assert!(delta_line.contains("-0.2500"));
        assert!(delta_line.contains("25.00"));
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn test_right_maps_to_contract_right() {
        assert_eq!(OptionRight::from(Right::Put), OptionRight::Put);
        assert_eq!(OptionRight::from(Right::Call), OptionRight::Call);
    }
}
