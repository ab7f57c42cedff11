//! Trend Classifier: UP/DOWN/NEUTRAL from a cached 24h-change figure and the
//! live book's bid/ask imbalance. The 24h-change collaborator (symbol
//! ranking / market stats) is external to this module; it only caches
//! whatever it is told and applies the classification rule at query time.
//! Cadence-cached external-stat pattern grounded on `vault/unified_15m_strategy.rs`'s
//! `AssetState`.

use crate::model::{OrderBook, Side, Trend, TrendDirection};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

struct CachedChange {
    change_24h_percent: Decimal,
    fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TrendClassifier {
    theta_percent: Decimal,
    imbalance_ratio: Decimal,
    max_staleness: Duration,
    cache: Arc<RwLock<HashMap<String, CachedChange>>>,
}

impl TrendClassifier {
    pub fn new(theta_percent: Decimal, imbalance_ratio: Decimal, max_staleness: Duration) -> Self {
        Self {
            theta_percent,
            imbalance_ratio,
            max_staleness,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Called by the external 24h-stats collaborator's polling loop (≥5 min
    /// cadence); this module just caches the value.
    pub fn record_24h_change(&self, symbol: &str, change_percent: Decimal) {
        self.cache.write().insert(
            symbol.to_string(),
            CachedChange {
                change_24h_percent: change_percent,
                fetched_at: Utc::now(),
            },
        );
    }

    /// Returns cached NEUTRAL if either the 24h change or the book is missing
    /// or the cached change has gone stale.
    pub fn trend(&self, symbol: &str, book: Option<&OrderBook>) -> Trend {
        let neutral = Trend {
            symbol: symbol.to_string(),
            direction: TrendDirection::Neutral,
            computed_at: Utc::now(),
        };

        let Some(book) = book else { return neutral };

        let change = {
            let cache = self.cache.read();
            match cache.get(symbol) {
                Some(c) if Utc::now() - c.fetched_at <= self.max_staleness => c.change_24h_percent,
                _ => return neutral,
            }
        };

        let bid_vol = book.total_bid_volume();
        let ask_vol = book.total_ask_volume();
        if bid_vol.is_zero() || ask_vol.is_zero() {
            return neutral;
        }

        let direction = if change >= self.theta_percent
            && book.imbalance(Side::Bid).unwrap_or(Decimal::ZERO) >= self.imbalance_ratio
        {
            TrendDirection::Up
        } else if change <= -self.theta_percent
            && book.imbalance(Side::Ask).unwrap_or(Decimal::ZERO) >= self.imbalance_ratio
        {
            TrendDirection::Down
        } else {
            TrendDirection::Neutral
        };

        Trend {
            symbol: symbol.to_string(),
            direction,
            computed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceLevel;
    use rust_decimal_macros::dec;

    fn book(bid_vol: Decimal, ask_vol: Decimal) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(100), bid_vol)],
            asks: vec![PriceLevel::new(dec!(101), ask_vol)],
        }
    }

    #[test]
    fn up_trend_requires_change_and_imbalance_together() {
        let c = TrendClassifier::new(dec!(2), dec!(1.5), Duration::minutes(10));
        c.record_24h_change("BTCUSDT", dec!(5));
        let t = c.trend("BTCUSDT", Some(&book(dec!(20), dec!(10))));
        assert_eq!(t.direction, TrendDirection::Up);
    }

    #[test]
    fn missing_24h_change_yields_neutral() {
        let c = TrendClassifier::new(dec!(2), dec!(1.5), Duration::minutes(10));
        let t = c.trend("BTCUSDT", Some(&book(dec!(20), dec!(10))));
        assert_eq!(t.direction, TrendDirection::Neutral);
    }

    #[test]
    fn stale_change_yields_neutral() {
        let c = TrendClassifier::new(dec!(2), dec!(1.5), Duration::seconds(0));
        c.record_24h_change("BTCUSDT", dec!(5));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t = c.trend("BTCUSDT", Some(&book(dec!(20), dec!(10))));
        assert_eq!(t.direction, TrendDirection::Neutral);
    }
}
