//! Synthetic paper market.
//!
//! A small JSON fixture describes each underlying (spot, volatilities,
//! listed expirations). Chains are priced with Black-Scholes off the
//! current clock and republished on a cadence so quotes never go stale
//! in a long-running paper session.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use options_guard_gateway::{
    EventCalendar, MarketSnapshot, OptionQuote, OptionRight, OptionsChain, OptionsContract,
    PaperMarketData, PriceBar, SignalWindow, StockQuote,
};
use options_guard_manager::greeks;
use options_guard_manager::types::{Account, PricingInputs};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// One listed underlying.
#[derive(Debug, Clone, Deserialize)]
pub struct Underlying {
    pub symbol: String,
    pub spot: Decimal,
    /// Flat implied volatility used to price every strike.
    pub implied_vol: f64,
    /// Trailing realized volatility reported on the signal window.
    pub realized_vol: f64,
    /// Daily drift of the synthetic price history, as a fraction.
    #[serde(default)]
    pub daily_drift: f64,
    pub expiries_days: Vec<i64>,
    #[serde(default = "default_strike_step")]
    pub strike_step: Decimal,
    /// Strikes are listed within this fraction of spot on either side.
    #[serde(default = "default_strike_range")]
    pub strike_range_pct: f64,
    #[serde(default)]
    pub events: EventCalendar,
}

fn default_strike_step() -> Decimal {
    Decimal::ONE
}

fn default_strike_range() -> f64 {
    0.15
}

fn default_history_days() -> usize {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperUniverse {
    pub underlyings: Vec<Underlying>,
    /// Accounts registered when the engine starts.
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default = "default_history_days")]
    pub history_days: usize,
}

impl PaperUniverse {
    /// Loads a universe fixture from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading paper market {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing paper market {}", path.display()))
    }

    /// Quotes, chains and signal windows for every underlying as of `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if a spot, strike or volatility cannot be priced.
    pub fn snapshot(&self, rate: f64, now: DateTime<Utc>) -> Result<MarketSnapshot> {
        let mut snapshot = MarketSnapshot::default();
        for u in &self.underlyings {
            snapshot.quotes.push(stock_quote(u, now));
            snapshot.chains.push(chain(u, rate, now)?);
            snapshot.windows.push(window(u, self.history_days, now)?);
        }
        Ok(snapshot)
    }

    /// Restamps every quote, chain and window in `feed` to `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::snapshot`].
    pub fn publish(&self, feed: &PaperMarketData, rate: f64, now: DateTime<Utc>) -> Result<()> {
        let snapshot = self.snapshot(rate, now)?;
        for quote in snapshot.quotes {
            feed.set_quote(quote);
        }
        for chain in snapshot.chains {
            feed.set_chain(chain);
        }
        for window in snapshot.windows {
            feed.set_window(window);
        }
        Ok(())
    }
}

fn stock_quote(u: &Underlying, now: DateTime<Utc>) -> StockQuote {
    StockQuote {
        symbol: u.symbol.to_uppercase(),
        bid: u.spot - dec!(0.01),
        ask: u.spot + dec!(0.01),
        last: u.spot,
        volume: 5_000_000,
        timestamp: now,
    }
}

fn chain(u: &Underlying, rate: f64, now: DateTime<Utc>) -> Result<OptionsChain> {
    let spot = u.spot.to_f64().context("spot out of range")?;
    let range = Decimal::from_f64(u.strike_range_pct).context("strike range out of range")?;
    let step = if u.strike_step > Decimal::ZERO {
        u.strike_step
    } else {
        Decimal::ONE
    };
    let low = (u.spot * (Decimal::ONE - range) / step).ceil() * step;
    let high = u.spot * (Decimal::ONE + range);

    let mut quotes = Vec::new();
    for &days in &u.expiries_days {
        let expiry = now.date_naive() + Duration::days(days);
        let mut strike = low;
        while strike <= high {
            for right in [OptionRight::Put, OptionRight::Call] {
                let inputs = PricingInputs {
                    spot,
                    strike: strike.to_f64().context("strike out of range")?,
                    days_to_expiry: days as f64,
                    volatility: u.implied_vol,
                    rate,
                    right,
                };
                let model = greeks::calculate(&inputs, now)
                    .with_context(|| format!("pricing {} {strike} {right:?}", u.symbol))?;
                let mid = Decimal::from_f64(model.price)
                    .unwrap_or_default()
                    .round_dp(2)
                    .max(dec!(0.01));
                let half = (mid * dec!(0.02)).max(dec!(0.01));
                quotes.push(OptionQuote {
                    contract: OptionsContract::new(&u.symbol, expiry, strike, right),
                    bid: (mid - half).max(Decimal::ZERO),
                    ask: mid + half,
                    last: mid,
                    volume: 1_000,
                    open_interest: 5_000,
                    iv: u.implied_vol,
                });
            }
            strike += step;
        }
    }

    Ok(OptionsChain {
        underlying: u.symbol.to_uppercase(),
        underlying_price: u.spot,
        as_of: now,
        quotes,
    })
}

/// Daily history ending at spot: compounded drift plus a small oscillation.
fn window(u: &Underlying, history_days: usize, now: DateTime<Utc>) -> Result<SignalWindow> {
    let spot = u.spot.to_f64().context("spot out of range")?;
    let n = history_days.max(1);
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let back = (n - 1 - i) as i32;
        let wiggle = if back == 0 { 0.0 } else { 0.004 * (i as f64).sin() };
        let close = spot * (1.0 + u.daily_drift).powi(-back) * (1.0 + wiggle);
        let close = Decimal::from_f64(close).context("price out of range")?.round_dp(2);
        let range = (close * dec!(0.005)).round_dp(2);
        bars.push(PriceBar {
            timestamp: now - Duration::days(i64::from(back)),
            open: close,
            high: close + range,
            low: close - range,
            close,
            volume: 5_000_000,
            implied_vol: u.implied_vol,
            realized_vol: u.realized_vol,
        });
    }
    Ok(SignalWindow {
        symbol: u.symbol.to_uppercase(),
        bars,
        events: u.events.clone(),
    })
}
