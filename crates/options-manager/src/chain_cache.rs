//! Shared option-chain cache.
//!
//! Readers clone an `Arc` snapshot and never block on a refresh. A single
//! writer fetches a new chain and swaps the entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use options_guard_gateway::{FeedError, MarketDataFeed, OptionsChain};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ChainCache {
    chains: RwLock<HashMap<String, Arc<OptionsChain>>>,
    writer: tokio::sync::Mutex<()>,
}

impl ChainCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Arc<OptionsChain>> {
        self.chains.read().get(&symbol.to_uppercase()).cloned()
    }

    /// Replaces the entry for the chain's underlying.
    pub fn insert(&self, chain: OptionsChain) -> Arc<OptionsChain> {
        let chain = Arc::new(chain);
        self.chains
            .write()
            .insert(chain.underlying.to_uppercase(), Arc::clone(&chain));
        chain
    }

    /// Fetches a fresh chain from the feed and swaps it in.
    ///
    /// # Errors
    ///
    /// Returns the feed error; the previous entry is left in place.
    pub async fn refresh(
        &self,
        feed: &dyn MarketDataFeed,
        symbol: &str,
    ) -> Result<Arc<OptionsChain>, FeedError> {
        let _writer = self.writer.lock().await;
        let chain = feed.option_chain(symbol).await?;
        debug!(symbol, quotes = chain.quotes.len(), as_of = %chain.as_of, "Chain refreshed");
        Ok(self.insert(chain))
    }

    /// Cached chain when younger than `max_age_secs`, otherwise a refresh.
    ///
    /// # Errors
    ///
    /// Returns the feed error when a refresh is needed and fails.
    pub async fn get_or_refresh(
        &self,
        feed: &dyn MarketDataFeed,
        symbol: &str,
        max_age_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Arc<OptionsChain>, FeedError> {
        if let Some(chain) = self.get(symbol) {
            if chain.age_secs(now) <= max_age_secs {
                return Ok(chain);
            }
        }
        self.refresh(feed, symbol).await
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{chain, now};
    use chrono::Duration;
    use options_guard_gateway::PaperMarketData;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn refresh_swaps_entry_without_touching_readers() {
        let feed = PaperMarketData::new();
        feed.set_chain(chain("SPY", dec!(100), dec!(5), 0.2, &[30]));
        let cache = ChainCache::new();

        let first = cache.refresh(&feed, "SPY").await.unwrap();
        feed.set_chain(chain("SPY", dec!(105), dec!(5), 0.2, &[30]));
        let second = cache.refresh(&feed, "SPY").await.unwrap();

        assert_eq!(first.underlying_price, dec!(100));
        assert_eq!(second.underlying_price, dec!(105));
        assert_eq!(cache.get("spy").unwrap().underlying_price, dec!(105));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_from_cache() {
        let feed = PaperMarketData::new();
        let cache = ChainCache::new();
        cache.insert(chain("SPY", dec!(100), dec!(5), 0.2, &[30]));

        let hit = cache.get_or_refresh(&feed, "SPY", 60, now()).await.unwrap();
        assert_eq!(hit.underlying_price, dec!(100));

        let miss = cache
            .get_or_refresh(&feed, "SPY", 60, now() + Duration::seconds(120))
            .await;
        assert!(matches!(miss, Err(FeedError::NotFound(_))));
        assert!(cache.get("SPY").is_some());
    }
}
