//! Bounded per-symbol ring buffers of (time, mid) and (time, bid_vol, ask_vol),
//! consumed by the Trend Classifier and the Position Monitor's velocity checks.
//! Grounded on `scrapers/binance_book_ticker.rs::HistoryBuffer`.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const CAPACITY: usize = 60;

#[derive(Debug, Clone, Copy)]
pub struct MidPoint {
    pub ts: DateTime<Utc>,
    pub mid: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumePoint {
    pub ts: DateTime<Utc>,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
}

#[derive(Default)]
struct SymbolHistory {
    mids: VecDeque<MidPoint>,
    volumes: VecDeque<VolumePoint>,
}

/// Per-symbol bounded history, shared by clone across tasks.
#[derive(Clone)]
pub struct HistoryBuffers {
    inner: Arc<RwLock<HashMap<String, SymbolHistory>>>,
}

impl HistoryBuffers {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn record(&self, symbol: &str, mid: Decimal, bid_volume: Decimal, ask_volume: Decimal) {
        let now = Utc::now();
        let mut map = self.inner.write();
        let entry = map.entry(symbol.to_string()).or_default();

        entry.mids.push_back(MidPoint { ts: now, mid });
        if entry.mids.len() > CAPACITY {
            entry.mids.pop_front();
        }

        entry.volumes.push_back(VolumePoint {
            ts: now,
            bid_volume,
            ask_volume,
        });
        if entry.volumes.len() > CAPACITY {
            entry.volumes.pop_front();
        }
    }

    /// Mid-price samples with timestamp >= now - window.
    pub fn mids_since(&self, symbol: &str, window: Duration) -> Vec<MidPoint> {
        let cutoff = Utc::now() - window;
        let map = self.inner.read();
        map.get(symbol)
            .map(|h| h.mids.iter().filter(|p| p.ts >= cutoff).copied().collect())
            .unwrap_or_default()
    }

    pub fn volumes_since(&self, symbol: &str, window: Duration) -> Vec<VolumePoint> {
        let cutoff = Utc::now() - window;
        let map = self.inner.read();
        map.get(symbol)
            .map(|h| h.volumes.iter().filter(|p| p.ts >= cutoff).copied().collect())
            .unwrap_or_default()
    }
}

impl Default for HistoryBuffers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn record_caps_buffer_at_capacity() {
        let h = HistoryBuffers::new();
        for i in 0..(CAPACITY + 10) {
            h.record("BTCUSDT", Decimal::from(i), dec!(1), dec!(1));
        }
        assert_eq!(h.mids_since("BTCUSDT", Duration::seconds(3600)).len(), CAPACITY);
    }

    #[test]
    fn mids_since_filters_by_window() {
        let h = HistoryBuffers::new();
        h.record("ETHUSDT", dec!(3000), dec!(1), dec!(1));
        let recent = h.mids_since("ETHUSDT", Duration::seconds(60));
        assert_eq!(recent.len(), 1);
        let none = h.mids_since("ETHUSDT", Duration::seconds(-1));
        assert!(none.is_empty());
    }
}
