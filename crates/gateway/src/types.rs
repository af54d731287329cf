//! Contract, quote, order, and fill types shared with the engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

/// An options contract specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionsContract {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub right: OptionRight,
}

impl OptionsContract {
    #[must_use]
    pub fn new(symbol: &str, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            expiry,
            strike,
            right,
        }
    }

    /// Human-readable contract description (e.g., "SPY 450P 2026-03-20").
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(
            "{} {}{} {}",
            self.symbol,
            self.strike.normalize(),
            self.right,
            self.expiry
        )
    }

    /// Calendar days until expiry, floored at zero.
    #[must_use]
    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now.date_naive()).num_days().max(0)
    }
}

/// Option quote from a chain snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub contract: OptionsContract,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub last: Decimal,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,
    /// Annualized implied volatility (0.25 = 25%).
    pub iv: f64,
}

impl OptionQuote {
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Bid/ask spread as a fraction of mid. `None` when the market is one-sided.
    #[must_use]
    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid();
        if self.bid <= Decimal::ZERO || self.ask < self.bid || mid <= Decimal::ZERO {
            return None;
        }
        ((self.ask - self.bid) / mid).to_f64()
    }
}

/// Underlying quote snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    #[serde(default)]
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

impl StockQuote {
    /// Mid when both sides are present, otherwise the last trade.
    #[must_use]
    pub fn price(&self) -> Decimal {
        if self.bid > Decimal::ZERO && self.ask >= self.bid {
            (self.bid + self.ask) / Decimal::TWO
        } else {
            self.last
        }
    }

    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that offsets this one.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// A single-leg order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsOrder {
    pub contract: OptionsContract,
    pub side: OrderSide,
    pub quantity: u32,
    pub order_type: OrderType,
}

impl OptionsOrder {
    #[must_use]
    pub fn limit(contract: OptionsContract, side: OrderSide, quantity: u32, price: Decimal) -> Self {
        Self {
            contract,
            side,
            quantity,
            order_type: OrderType::Limit { price },
        }
    }
}

/// A confirmed fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsFill {
    pub order_id: String,
    /// Idempotency key the order was submitted under.
    pub key: String,
    pub contract: OptionsContract,
    pub side: OrderSide,
    pub quantity: u32,
    pub avg_fill_price: Decimal,
    pub commission: Decimal,
    pub filled_at: DateTime<Utc>,
}

impl OptionsFill {
    /// Order that offsets this fill.
    #[must_use]
    pub fn offsetting_order(&self) -> OptionsOrder {
        OptionsOrder::limit(
            self.contract.clone(),
            self.side.opposite(),
            self.quantity,
            self.avg_fill_price,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn put() -> OptionsContract {
        OptionsContract::new(
            "spy",
            NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            dec!(450.00),
            OptionRight::Put,
        )
    }

    #[test]
    fn display_name_normalizes_strike() {
        assert_eq!(put().display_name(), "SPY 450P 2026-03-20");
    }

    #[test]
    fn spread_pct_of_mid() {
        let quote = OptionQuote {
            contract: put(),
            bid: dec!(1.90),
            ask: dec!(2.10),
            last: dec!(2.00),
            volume: 0,
            open_interest: 0,
            iv: 0.2,
        };
        assert_eq!(quote.mid(), dec!(2.00));
        assert!((quote.spread_pct().unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn one_sided_market_has_no_spread() {
        let quote = OptionQuote {
            contract: put(),
            bid: dec!(0),
            ask: dec!(0.05),
            last: dec!(0),
            volume: 0,
            open_interest: 0,
            iv: 0.2,
        };
        assert!(quote.spread_pct().is_none());
    }

    #[test]
    fn offsetting_order_flips_side() {
        let fill = OptionsFill {
            order_id: "PAPER-1".to_string(),
            key: "k:0".to_string(),
            contract: put(),
            side: OrderSide::Sell,
            quantity: 2,
            avg_fill_price: dec!(1.25),
            commission: dec!(1.30),
            filled_at: Utc::now(),
        };
        let order = fill.offsetting_order();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.quantity, 2);
        assert_eq!(order.order_type, OrderType::Limit { price: dec!(1.25) });
    }
}
