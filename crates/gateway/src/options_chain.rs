//! Options chain snapshots and filtering.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OptionQuote, OptionRight};

/// Options chain for a single underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsChain {
    pub underlying: String,
    pub underlying_price: Decimal,
    pub as_of: DateTime<Utc>,
    pub quotes: Vec<OptionQuote>,
}

/// Filter for querying a subset of the chain.
#[derive(Debug, Clone, Default)]
pub struct ChainFilter {
    /// Filter to a specific expiration.
    pub expiry: Option<NaiveDate>,
    /// Filter to specific right (call/put).
    pub right: Option<OptionRight>,
    /// Minimum strike price.
    pub min_strike: Option<Decimal>,
    /// Maximum strike price.
    pub max_strike: Option<Decimal>,
    /// Earliest expiration.
    pub min_expiry: Option<NaiveDate>,
    /// Latest expiration.
    pub max_expiry: Option<NaiveDate>,
    /// Minimum open interest.
    pub min_open_interest: Option<u64>,
}

impl ChainFilter {
    #[must_use]
    pub fn matches(&self, quote: &OptionQuote) -> bool {
        let c = &quote.contract;
        self.expiry.map_or(true, |e| c.expiry == e)
            && self.right.map_or(true, |r| c.right == r)
            && self.min_strike.map_or(true, |s| c.strike >= s)
            && self.max_strike.map_or(true, |s| c.strike <= s)
            && self.min_expiry.map_or(true, |e| c.expiry >= e)
            && self.max_expiry.map_or(true, |e| c.expiry <= e)
            && self
                .min_open_interest
                .map_or(true, |oi| quote.open_interest >= oi)
    }
}

impl OptionsChain {
    /// Quotes matching the filter, in chain order.
    #[must_use]
    pub fn filter(&self, filter: &ChainFilter) -> Vec<&OptionQuote> {
        self.quotes.iter().filter(|q| filter.matches(q)).collect()
    }

    /// Distinct expirations, ascending.
    #[must_use]
    pub fn expirations(&self) -> Vec<NaiveDate> {
        let mut out: Vec<NaiveDate> = self.quotes.iter().map(|q| q.contract.expiry).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Quotes for one expiration and right, sorted by strike.
    #[must_use]
    pub fn strip(&self, expiry: NaiveDate, right: OptionRight) -> Vec<&OptionQuote> {
        let mut strip: Vec<&OptionQuote> = self
            .quotes
            .iter()
            .filter(|q| q.contract.expiry == expiry && q.contract.right == right)
            .collect();
        strip.sort_by(|a, b| a.contract.strike.cmp(&b.contract.strike));
        strip
    }

    /// Exact contract lookup.
    #[must_use]
    pub fn find(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Option<&OptionQuote> {
        self.quotes.iter().find(|q| {
            q.contract.expiry == expiry && q.contract.strike == strike && q.contract.right == right
        })
    }

    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.as_of).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OptionsContract;
    use rust_decimal_macros::dec;

    fn chain() -> OptionsChain {
        let near = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        let far = NaiveDate::from_ymd_opt(2026, 4, 17).unwrap();
        let mut quotes = Vec::new();
        for expiry in [far, near] {
            for strike in [dec!(105), dec!(95), dec!(100)] {
                for right in [OptionRight::Call, OptionRight::Put] {
                    quotes.push(OptionQuote {
                        contract: OptionsContract::new("XYZ", expiry, strike, right),
                        bid: dec!(1.00),
                        ask: dec!(1.10),
                        last: dec!(1.05),
                        volume: 10,
                        open_interest: if strike == dec!(95) { 5 } else { 500 },
                        iv: 0.3,
                    });
                }
            }
        }
        OptionsChain {
            underlying: "XYZ".to_string(),
            underlying_price: dec!(100),
            as_of: Utc::now(),
            quotes,
        }
    }

    #[test]
    fn expirations_are_sorted_and_distinct() {
        let exps = chain().expirations();
        assert_eq!(exps.len(), 2);
        assert!(exps[0] < exps[1]);
    }

    #[test]
    fn strip_is_sorted_by_strike() {
        let c = chain();
        let near = c.expirations()[0];
        let strikes: Vec<Decimal> = c
            .strip(near, OptionRight::Put)
            .iter()
            .map(|q| q.contract.strike)
            .collect();
        assert_eq!(strikes, vec![dec!(95), dec!(100), dec!(105)]);
    }

    #[test]
    fn filter_combines_constraints() {
        let c = chain();
        let filter = ChainFilter {
            right: Some(OptionRight::Call),
            min_strike: Some(dec!(96)),
            min_open_interest: Some(100),
            ..Default::default()
        };
        let hits = c.filter(&filter);
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|q| q.contract.right == OptionRight::Call));
    }

    #[test]
    fn find_exact_contract() {
        let c = chain();
        let near = c.expirations()[0];
        assert!(c.find(near, dec!(100), OptionRight::Put).is_some());
        assert!(c.find(near, dec!(101), OptionRight::Put).is_none());
    }
}
