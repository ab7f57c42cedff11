//! Signal Generator: turns density lifecycle events into BREAKOUT/BOUNCE
//! candidates under the current trend. Gate-chain evaluation style grounded
//! on `vault/unified_15m_strategy.rs::on_order`'s ordered boolean checks.

use crate::density::DensityEvent;
use crate::history::HistoryBuffers;
use crate::model::{CoinParameters, Direction, OrderBook, Side, Signal, SignalKind, Trend, TrendDirection};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Book quiet-activity proxy: bounce candidates should occur
/// at densities with low measured book activity, but provides no trade-tape
/// feed and no dedicated threshold field in CoinParameters. This uses
/// recent mid-price velocity from the History Buffers as the proxy signal:
/// a quiet book moves slowly.
const QUIET_VELOCITY_THRESHOLD_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05%

#[derive(Clone)]
pub struct SignalGenerator {
    history: HistoryBuffers,
    /// Locally tracked extremum per (symbol, side) for breakout priority scoring.
    extrema: Arc<RwLock<HashMap<(String, Side), Decimal>>>,
}

impl SignalGenerator {
    pub fn new(history: HistoryBuffers) -> Self {
        Self {
            history,
            extrema: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn evaluate(
        &self,
        event: &DensityEvent,
        trend: &Trend,
        book: &OrderBook,
        params: &CoinParameters,
    ) -> Option<Signal> {
        let density = match event {
            DensityEvent::Updated(d) | DensityEvent::Appeared(d) => d,
            DensityEvent::Disappeared(_) => return None,
        };
        let mid = book.mid_price()?;

        if let Some(sig) = self.try_breakout(density, trend, mid, params) {
            return Some(sig);
        }
        self.try_bounce(density, trend, mid, book.symbol.as_str(), params)
    }

    fn try_breakout(
        &self,
        density: &crate::model::Density,
        trend: &Trend,
        mid: Decimal,
        params: &CoinParameters,
    ) -> Option<Signal> {
        let direction = match (density.side, trend.direction) {
            (Side::Ask, TrendDirection::Up) => Direction::Long,
            (Side::Bid, TrendDirection::Down) => Direction::Short,
            _ => return None,
        };

        if density.erosion_percent() < params.breakout_erosion_percent {
            return None;
        }

        let crossed = match direction {
            Direction::Long => mid > density.price_level,
            Direction::Short => mid < density.price_level,
        };
        if !crossed {
            return None;
        }

        let offset = density.price_level * params.breakout_min_stop_loss_percent / Decimal::ONE_HUNDRED;
        let stop_loss = match direction {
            Direction::Long => density.price_level - offset,
            Direction::Short => density.price_level + offset,
        };

        let priority = self.score_breakout_priority(&density.symbol, density.side, mid);

        Some(Signal {
            id: uuid::Uuid::new_v4(),
            symbol: density.symbol.clone(),
            kind: SignalKind::Breakout,
            direction,
            entry_price: mid,
            stop_loss,
            density_price: density.price_level,
            density_side: density.side,
            priority,
            created_at: Utc::now(),
            consumed: false,
        })
    }

    fn try_bounce(
        &self,
        density: &crate::model::Density,
        trend: &Trend,
        mid: Decimal,
        symbol: &str,
        params: &CoinParameters,
    ) -> Option<Signal> {
        let direction = match (density.side, trend.direction) {
            (Side::Bid, TrendDirection::Up) => Direction::Long,
            (Side::Ask, TrendDirection::Down) => Direction::Short,
            _ => return None,
        };

        let touch_pct = (mid - density.price_level).abs() / density.price_level * Decimal::ONE_HUNDRED;
        if touch_pct > params.touch_tolerance_percent {
            return None;
        }
        if density.erosion_percent() >= params.bounce_density_stable_percent {
            return None;
        }
        if !self.is_book_quiet(symbol) {
            return None;
        }

        let offset = density.price_level * params.bounce_stop_loss_behind_density_percent / Decimal::ONE_HUNDRED;
        let stop_loss = match direction {
            Direction::Long => density.price_level - offset,
            Direction::Short => density.price_level + offset,
        };

        Some(Signal {
            id: uuid::Uuid::new_v4(),
            symbol: symbol.to_string(),
            kind: SignalKind::Bounce,
            direction,
            entry_price: mid,
            stop_loss,
            density_price: density.price_level,
            density_side: density.side,
            priority: 0,
            created_at: Utc::now(),
            consumed: false,
        })
    }

    fn is_book_quiet(&self, symbol: &str) -> bool {
        let points = self.history.mids_since(symbol, Duration::seconds(10));
        if points.len() < 2 {
            return true;
        }
        let first = points.first().unwrap();
        let last = points.last().unwrap();
        if first.mid.is_zero() {
            return true;
        }
        let move_pct = (last.mid - first.mid).abs() / first.mid * Decimal::ONE_HUNDRED;
        move_pct <= QUIET_VELOCITY_THRESHOLD_PERCENT
    }

    /// Breakouts entering new territory beyond the locally tracked extremum
    /// score higher than in-range moves; ties are broken by recency at the
    /// Validator/queue layer (created_at ordering).
    fn score_breakout_priority(&self, symbol: &str, side: Side, mid: Decimal) -> i32 {
        let key = (symbol.to_string(), side);
        let mut extrema = self.extrema.write();
        let entry = extrema.entry(key).or_insert(mid);
        let is_new_territory = match side {
            Side::Ask => mid > *entry,
            Side::Bid => mid < *entry,
        };
        if is_new_territory {
            *entry = mid;
            10
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Density, PriceLevel};
    use rust_decimal_macros::dec;

    fn params() -> CoinParameters {
        CoinParameters {
            symbol: "BTCUSDT".into(),
            density_threshold_abs: dec!(100000),
            relative_multiplier: dec!(2),
            density_threshold_percent: dec!(10),
            cluster_range_percent: dec!(0.05),
            breakout_erosion_percent: dec!(30),
            breakout_min_stop_loss_percent: dec!(0.1),
            bounce_density_stable_percent: dec!(10),
            bounce_density_erosion_exit_percent: dec!(65),
            bounce_stop_loss_behind_density_percent: dec!(0.1),
            breakeven_profit_percent: dec!(0.5),
            touch_tolerance_percent: dec!(0.2),
            lot_step: dec!(0.001),
            enabled: true,
        }
    }

    fn ask_density(erosion_initial: Decimal, erosion_current: Decimal) -> Density {
        Density {
            symbol: "BTCUSDT".into(),
            side: Side::Ask,
            price_level: dec!(50000),
            initial_volume: erosion_initial,
            current_volume: erosion_current,
            appeared_at: Utc::now(),
            last_seen_at: Utc::now(),
            disappeared_at: None,
            is_cluster: false,
            consecutive_absolute_failures: 0,
        }
    }

    fn up_trend() -> Trend {
        Trend {
            symbol: "BTCUSDT".into(),
            direction: TrendDirection::Up,
            computed_at: Utc::now(),
        }
    }

    fn book(mid: Decimal) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(mid - dec!(0.5), dec!(1))],
            asks: vec![PriceLevel::new(mid + dec!(0.5), dec!(1))],
        }
    }

    #[test]
    fn breakout_happy_path_produces_entry_and_stop_loss() {
        let gen = SignalGenerator::new(HistoryBuffers::new());
        let density = ask_density(dec!(10), dec!(6.5)); // 35% erosion, >= 30% threshold
        let event = DensityEvent::Updated(density);
        let trend = up_trend();
        let book = book(dec!(50005));
        let params = params();

        let signal = gen.evaluate(&event, &trend, &book, &params).unwrap();
        assert_eq!(signal.kind, SignalKind::Breakout);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, dec!(50005));
        assert_eq!(signal.stop_loss, dec!(49950));
    }

    #[test]
    fn breakout_rejected_when_erosion_below_threshold() {
        let gen = SignalGenerator::new(HistoryBuffers::new());
        let density = ask_density(dec!(10), dec!(8)); // 20% erosion, below 30%
        let event = DensityEvent::Updated(density);
        let trend = up_trend();
        let book = book(dec!(50005));
        assert!(gen.evaluate(&event, &trend, &book, &params()).is_none());
    }
}
