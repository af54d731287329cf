//! Market data and broker gateway boundary for options trading.
//!
//! Defines the contract, quote, chain, order, and fill types the engine
//! consumes, the [`MarketDataFeed`] and [`BrokerGateway`] traits, and paper
//! implementations of both for local runs and tests.

pub mod execution;
pub mod market_data;
pub mod options_chain;
pub mod paper;
pub mod types;

pub use execution::{BrokerGateway, GatewayError};
pub use market_data::{
    EventCalendar, FeedError, MarketDataFeed, MarketSnapshot, PaperMarketData, PriceBar,
    SignalWindow,
};
pub use options_chain::{ChainFilter, OptionsChain};
pub use paper::{PaperBroker, PaperBrokerConfig, ScriptedOutcome};
pub use types::{
    OptionQuote, OptionRight, OptionsContract, OptionsFill, OptionsOrder, OrderSide, OrderType,
    StockQuote,
};
