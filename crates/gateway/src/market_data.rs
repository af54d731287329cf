//! Market data feed boundary: underlying quotes, option chains, and the
//! signal window the regime detector reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::options_chain::OptionsChain;
use crate::types::StockQuote;

/// A daily price bar with the volatility readings that accompany it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    /// At-the-money implied volatility at the close.
    pub implied_vol: f64,
    /// Trailing realized volatility at the close.
    pub realized_vol: f64,
}

/// Scheduled events that override statistical regimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventCalendar {
    pub next_earnings: Option<DateTime<Utc>>,
    pub next_macro_event: Option<DateTime<Utc>>,
    pub macro_event_name: Option<String>,
}

/// Rolling window of bars for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWindow {
    pub symbol: String,
    pub bars: Vec<PriceBar>,
    #[serde(default)]
    pub events: EventCalendar,
}

impl SignalWindow {
    #[must_use]
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.timestamp)
    }

    #[must_use]
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }
}

/// Errors surfaced by a market data feed.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("No market data for {0}")]
    NotFound(String),

    #[error("Feed unavailable: {0}")]
    Unavailable(String),
}

/// Source of quotes, chains, and signal windows.
///
/// Implementations return whatever they last saw; freshness is judged by the
/// caller from the embedded timestamps.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<StockQuote, FeedError>;

    async fn option_chain(&self, symbol: &str) -> Result<OptionsChain, FeedError>;

    async fn signal_window(&self, symbol: &str) -> Result<SignalWindow, FeedError>;
}

/// Serialized form of a paper market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    #[serde(default)]
    pub quotes: Vec<StockQuote>,
    #[serde(default)]
    pub chains: Vec<OptionsChain>,
    #[serde(default)]
    pub windows: Vec<SignalWindow>,
}

#[derive(Debug, Default)]
struct PaperMarket {
    quotes: HashMap<String, StockQuote>,
    chains: HashMap<String, OptionsChain>,
    windows: HashMap<String, SignalWindow>,
}

/// In-memory feed for paper mode and tests.
#[derive(Debug, Default)]
pub struct PaperMarketData {
    market: RwLock<PaperMarket>,
}

impl PaperMarketData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_snapshot(snapshot: MarketSnapshot) -> Self {
        let feed = Self::new();
        for quote in snapshot.quotes {
            feed.set_quote(quote);
        }
        for chain in snapshot.chains {
            feed.set_chain(chain);
        }
        for window in snapshot.windows {
            feed.set_window(window);
        }
        feed
    }

    /// Parses a JSON market snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match [`MarketSnapshot`].
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let snapshot: MarketSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Loads a JSON market snapshot from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn set_quote(&self, quote: StockQuote) {
        self.market
            .write()
            .quotes
            .insert(quote.symbol.to_uppercase(), quote);
    }

    pub fn set_chain(&self, chain: OptionsChain) {
        self.market
            .write()
            .chains
            .insert(chain.underlying.to_uppercase(), chain);
    }

    pub fn set_window(&self, window: SignalWindow) {
        self.market
            .write()
            .windows
            .insert(window.symbol.to_uppercase(), window);
    }

    pub fn remove_quote(&self, symbol: &str) {
        self.market.write().quotes.remove(&symbol.to_uppercase());
    }

    /// Moves the underlying and every chain quote timestamp to `now`.
    ///
    /// Fixture snapshots are recorded once; paper mode restamps them so the
    /// staleness check sees live data.
    pub fn restamp(&self, now: DateTime<Utc>) {
        let mut market = self.market.write();
        for quote in market.quotes.values_mut() {
            quote.timestamp = now;
        }
        for chain in market.chains.values_mut() {
            chain.as_of = now;
        }
    }

    /// Symbols with an underlying quote.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.market.read().quotes.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl MarketDataFeed for PaperMarketData {
    async fn quote(&self, symbol: &str) -> Result<StockQuote, FeedError> {
        debug!(symbol, "Paper quote");
        self.market
            .read()
            .quotes
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| FeedError::NotFound(symbol.to_string()))
    }

    async fn option_chain(&self, symbol: &str) -> Result<OptionsChain, FeedError> {
        debug!(symbol, "Paper option chain");
        self.market
            .read()
            .chains
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| FeedError::NotFound(symbol.to_string()))
    }

    async fn signal_window(&self, symbol: &str) -> Result<SignalWindow, FeedError> {
        self.market
            .read()
            .windows
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| FeedError::NotFound(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SNAPSHOT: &str = r#"{
        "quotes": [
            {"symbol": "spy", "bid": "449.9", "ask": "450.1", "last": "450", "timestamp": "2026-01-05T15:00:00Z"}
        ],
        "chains": [
            {"underlying": "SPY", "underlying_price": "450", "as_of": "2026-01-05T15:00:00Z", "quotes": []}
        ]
    }"#;

    #[tokio::test]
    async fn loads_snapshot_json() {
        let feed = PaperMarketData::from_json(SNAPSHOT).unwrap();
        let quote = feed.quote("SPY").await.unwrap();
        assert_eq!(quote.price(), Decimal::from(450));
        assert!(feed.option_chain("spy").await.is_ok());
        assert!(matches!(
            feed.signal_window("SPY").await,
            Err(FeedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn restamp_refreshes_timestamps() {
        let feed = PaperMarketData::from_json(SNAPSHOT).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        feed.restamp(now);
        assert_eq!(feed.quote("SPY").await.unwrap().timestamp, now);
        assert_eq!(feed.option_chain("SPY").await.unwrap().as_of, now);
    }

    #[tokio::test]
    async fn missing_symbol_is_not_found() {
        let feed = PaperMarketData::new();
        assert!(matches!(feed.quote("QQQ").await, Err(FeedError::NotFound(_))));
    }
}
