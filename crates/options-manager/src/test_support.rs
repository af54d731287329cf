//! Shared fixtures for unit tests.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use options_guard_gateway::{OptionQuote, OptionRight, OptionsChain, OptionsContract};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::greeks;
use crate::types::PricingInputs;

pub(crate) const RATE: f64 = 0.045;

pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 15, 0, 0).unwrap()
}

pub(crate) fn expiry(days: i64) -> NaiveDate {
    expiry_at(now(), days)
}

pub(crate) fn expiry_at(at: DateTime<Utc>, days: i64) -> NaiveDate {
    at.date_naive() + Duration::days(days)
}

/// Black-Scholes-priced quote with a two-cent-or-2% spread around the model price.
pub(crate) fn quote(symbol: &str, spot: f64, strike: Decimal, right: OptionRight, days: i64, iv: f64) -> OptionQuote {
    quote_at(now(), symbol, spot, strike, right, days, iv)
}

pub(crate) fn quote_at(
    at: DateTime<Utc>,
    symbol: &str,
    spot: f64,
    strike: Decimal,
    right: OptionRight,
    days: i64,
    iv: f64,
) -> OptionQuote {
    let inputs = PricingInputs {
        spot,
        strike: strike.to_f64().unwrap(),
        days_to_expiry: days as f64,
        volatility: iv,
        rate: RATE,
        right,
    };
    let model = greeks::calculate(&inputs, at).unwrap().price.max(0.01);
    let mid = Decimal::from_f64(model).unwrap().round_dp(2).max(Decimal::new(1, 2));
    let half = (mid * Decimal::new(1, 2)).max(Decimal::new(1, 2));
    OptionQuote {
        contract: OptionsContract::new(symbol, expiry_at(at, days), strike, right),
        bid: (mid - half).max(Decimal::ZERO),
        ask: mid + half,
        last: mid,
        volume: 500,
        open_interest: 2_000,
        iv,
    }
}

/// Chain with strikes every `step` from 80% to 120% of spot, both rights, for each expiry.
pub(crate) fn chain(symbol: &str, spot: Decimal, step: Decimal, iv: f64, days: &[i64]) -> OptionsChain {
    chain_at(now(), symbol, spot, step, iv, days)
}

pub(crate) fn chain_at(
    at: DateTime<Utc>,
    symbol: &str,
    spot: Decimal,
    step: Decimal,
    iv: f64,
    days: &[i64],
) -> OptionsChain {
    let s = spot.to_f64().unwrap();
    let lo = (spot * Decimal::new(8, 1) / step).floor() * step;
    let hi = spot * Decimal::new(12, 1);
    let mut quotes = Vec::new();
    for d in days {
        let mut k = lo;
        while k <= hi {
            quotes.push(quote_at(at, symbol, s, k, OptionRight::Put, *d, iv));
            quotes.push(quote_at(at, symbol, s, k, OptionRight::Call, *d, iv));
            k += step;
        }
    }
    OptionsChain {
        underlying: symbol.to_uppercase(),
        underlying_price: spot,
        as_of: at,
        quotes,
    }
}
