//! Engine harness for integration tests: paper feed, paper broker and one
//! funded account, with chains priced off the current wall clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use options_guard_core::AppConfig;
use options_guard_gateway::{
    OptionQuote, OptionRight, OptionsChain, OptionsContract, PaperBroker, PaperMarketData,
    PriceBar, SignalWindow, StockQuote,
};
use options_guard_manager::greeks;
use options_guard_manager::types::{
    Account, ChannelKind, Leg, Position, PositionId, PricingInputs, RiskTolerance, StrategyType,
};
use options_guard_manager::{
    EngineApi, EngineContext, EngineService, InAppFeed, LogChannel, NotificationChannel,
};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

pub const RATE: f64 = 0.045;
pub const USER: &str = "u1";

pub fn expiry(days: i64) -> NaiveDate {
    Utc::now().date_naive() + Duration::days(days)
}

/// Quote priced at `pricing_iv` that advertises `iv`.
pub fn option_quote(
    at: DateTime<Utc>,
    symbol: &str,
    spot: f64,
    strike: Decimal,
    right: OptionRight,
    days: i64,
    pricing_iv: f64,
    iv: f64,
) -> OptionQuote {
    let inputs = PricingInputs {
        spot,
        strike: strike.to_f64().unwrap(),
        days_to_expiry: days as f64,
        volatility: pricing_iv,
        rate: RATE,
        right,
    };
    let model = greeks::calculate(&inputs, at).unwrap().price.max(0.01);
    let mid = Decimal::from_f64(model).unwrap().round_dp(2).max(dec!(0.01));
    let half = (mid * dec!(0.01)).max(dec!(0.01));
    OptionQuote {
        contract: OptionsContract::new(symbol, at.date_naive() + Duration::days(days), strike, right),
        bid: (mid - half).max(Decimal::ZERO),
        ask: mid + half,
        last: mid,
        volume: 500,
        open_interest: 2_000,
        iv,
    }
}

/// Strikes every dollar from 80% to 120% of spot, both rights.
pub fn chain(symbol: &str, spot: Decimal, iv: f64, days: &[i64]) -> OptionsChain {
    let at = Utc::now();
    let s = spot.to_f64().unwrap();
    let pricing_iv = if iv > 0.0 { iv } else { 0.2 };
    let mut quotes = Vec::new();
    for d in days {
        let mut k = (spot * dec!(0.8)).floor();
        while k <= spot * dec!(1.2) {
            for right in [OptionRight::Put, OptionRight::Call] {
                quotes.push(option_quote(at, symbol, s, k, right, *d, pricing_iv, iv));
            }
            k += Decimal::ONE;
        }
    }
    OptionsChain {
        underlying: symbol.to_uppercase(),
        underlying_price: spot,
        as_of: at,
        quotes,
    }
}

pub fn stock_quote(symbol: &str, price: Decimal) -> StockQuote {
    StockQuote {
        symbol: symbol.to_uppercase(),
        bid: price - dec!(0.01),
        ask: price + dec!(0.01),
        last: price,
        volume: 1_000_000,
        timestamp: Utc::now(),
    }
}

/// One-bar window carrying a realized volatility reading.
pub fn window(symbol: &str, close: Decimal, implied_vol: f64, realized_vol: f64) -> SignalWindow {
    SignalWindow {
        symbol: symbol.to_uppercase(),
        bars: vec![PriceBar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000_000,
            implied_vol,
            realized_vol,
        }],
        events: Default::default(),
    }
}

pub struct Engine {
    pub api: EngineApi,
    pub service: Arc<EngineService>,
    pub feed: Arc<PaperMarketData>,
    pub broker: Arc<PaperBroker>,
    pub in_app: Arc<InAppFeed>,
}

pub fn engine(config: AppConfig) -> Engine {
    let (_tx, rx) = watch::channel(config);
    let feed = Arc::new(PaperMarketData::new());
    let broker = Arc::new(PaperBroker::default());
    let in_app = Arc::new(InAppFeed::new());
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        in_app.clone() as Arc<dyn NotificationChannel>,
        Arc::new(LogChannel::new(ChannelKind::Push)) as Arc<dyn NotificationChannel>,
        Arc::new(LogChannel::new(ChannelKind::Email)) as Arc<dyn NotificationChannel>,
    ];
    let ctx = EngineContext::new(rx, feed.clone(), broker.clone(), channels, None);
    let (service, _worker) = EngineService::start(ctx);
    let api = EngineApi::new(Arc::clone(&service));
    api.set_account(Account {
        user_id: USER.to_string(),
        equity: dec!(100000),
        risk_tolerance: RiskTolerance::Medium,
    });
    Engine {
        api,
        service,
        feed,
        broker,
        in_app,
    }
}

impl Engine {
    /// Publishes a fresh quote and chain for `symbol`.
    pub fn publish(&self, symbol: &str, spot: Decimal, iv: f64, days: &[i64]) -> OptionsChain {
        let chain = chain(symbol, spot, iv, days);
        self.feed.set_chain(chain.clone());
        self.feed.set_quote(stock_quote(symbol, spot));
        chain
    }

    /// Registers one short put on `symbol` directly in the store.
    pub fn short_put(&self, symbol: &str, strike: Decimal, days: i64, target_delta: f64) -> PositionId {
        let contract = OptionsContract::new(symbol, expiry(days), strike, OptionRight::Put);
        let legs = vec![Leg::new(contract, -1, dec!(1.00))];
        let position = Position::new(USER, symbol, StrategyType::Custom, legs, 1, target_delta, Utc::now());
        self.service.context().store.add_position(position)
    }
}
