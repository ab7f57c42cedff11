//! Position Monitor: per-position breakeven promotion and the ordered
//! exit evaluator. Exit-before-entry evaluation ordering is grounded on
//! `vault/unified_15m_strategy.rs::on_order`.

use crate::density::DensityTracker;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionCore;
use crate::history::HistoryBuffers;
use crate::model::{CoinParameters, Direction, ExitReason, OrderBook, Position, Side, SignalKind};
use crate::registry::PositionRegistry;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const VELOCITY_SHORT_WINDOW_SEC: i64 = 3;
const VELOCITY_LONG_WINDOW_SEC: i64 = 15;
const MIN_VELOCITY_SAMPLES: usize = 10;

/// Trailing imbalance mean window used by AGGRESSIVE_REVERSAL.
const IMBALANCE_TRAILING_WINDOW_SEC: i64 = 10;

pub struct PositionMonitor<C: ExchangeClient> {
    registry: Arc<PositionRegistry>,
    history: HistoryBuffers,
    density: DensityTracker,
    execution: Arc<ExecutionCore<C>>,
    velocity_slowdown_threshold: Decimal,
    imbalance_change_threshold: Decimal,
    trailing_imbalance: Arc<RwLock<HashMap<String, Vec<(chrono::DateTime<Utc>, Decimal)>>>>,
}

impl<C: ExchangeClient> PositionMonitor<C> {
    pub fn new(
        registry: Arc<PositionRegistry>,
        history: HistoryBuffers,
        density: DensityTracker,
        execution: Arc<ExecutionCore<C>>,
        velocity_slowdown_threshold: Decimal,
        imbalance_change_threshold: Decimal,
    ) -> Self {
        Self {
            registry,
            history,
            density,
            execution,
            velocity_slowdown_threshold,
            imbalance_change_threshold,
            trailing_imbalance: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Runs one evaluation cycle across all currently open positions.
    /// Intended to be driven by the Orchestrator's ~1 s loop.
    pub async fn tick(&self, books: &HashMap<String, OrderBook>, params: &HashMap<String, CoinParameters>) {
        for position in self.registry.open_positions() {
            let Some(book) = books.get(&position.symbol) else {
                continue;
            };
            self.record_imbalance(&position.symbol, book);

            let Some(mid) = book.mid_price() else { continue };
            let p = params.get(&position.symbol);

            self.try_breakeven(&position, mid, p).await;

            if let Some(reason) = self.evaluate_exit(&position, book, mid, p) {
                self.close(&position, reason).await;
            }
        }
    }

    async fn try_breakeven(&self, position: &Position, mid: Decimal, params: Option<&CoinParameters>) {
        if position.breakeven_moved {
            return;
        }
        let Some(params) = params else { return };

        let triggered = match position.signal_kind {
            SignalKind::Breakout => position.unrealized_pnl_percent(mid) >= params.breakeven_profit_percent,
            SignalKind::Bounce => {
                let erosion = self
                    .density
                    .get(&position.symbol, opposite_entry_side(position), position.density_price)
                    .map(|d| d.erosion_percent())
                    .unwrap_or(Decimal::ZERO);
                erosion >= params.bounce_density_erosion_exit_percent
            }
        };
        if !triggered {
            return;
        }

        match self.execution.set_trading_stop(&position.symbol, position.entry_price).await {
            Ok(()) => {
                if let Err(e) = self.registry.update_stop(&position.symbol, position.entry_price, true).await {
                    error!(symbol = %position.symbol, error = %e, "failed to persist breakeven stop update");
                }
                info!(symbol = %position.symbol, "breakeven stop confirmed");
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "breakeven stop-set failed, retrying next cycle");
            }
        }
    }

    fn evaluate_exit(
        &self,
        position: &Position,
        book: &OrderBook,
        mid: Decimal,
        params: Option<&CoinParameters>,
    ) -> Option<ExitReason> {
        if self.momentum_slowdown(&position.symbol) {
            return Some(ExitReason::MomentumSlowdown);
        }
        if self.counter_density(position, mid) {
            return Some(ExitReason::CounterDensity);
        }
        if self.aggressive_reversal(position, book) {
            return Some(ExitReason::AggressiveReversal);
        }
        if position.signal_kind == SignalKind::Breakout && self.return_to_range(position, mid) {
            return Some(ExitReason::ReturnToRange);
        }
        if position.signal_kind == SignalKind::Bounce {
            let bid_side = match position.direction {
                Direction::Long => Side::Bid,
                Direction::Short => Side::Ask,
            };
            let density = self.density.get(&position.symbol, bid_side, position.density_price);
            let threshold = params.map(|p| p.bounce_density_erosion_exit_percent);
            match (density, threshold) {
                (Some(d), Some(t)) if d.erosion_percent() >= t => return Some(ExitReason::DensityErosion),
                (None, _) => return Some(ExitReason::DensityErosion),
                _ => {}
            }
        }
        None
    }

    fn momentum_slowdown(&self, symbol: &str) -> bool {
        let short = self.history.mids_since(symbol, Duration::seconds(VELOCITY_SHORT_WINDOW_SEC));
        let long = self.history.mids_since(symbol, Duration::seconds(VELOCITY_LONG_WINDOW_SEC));
        if long.len() < MIN_VELOCITY_SAMPLES {
            return false;
        }
        let v_short = velocity(&short);
        let v_long = velocity(&long);
        if v_long.is_zero() {
            return false;
        }
        v_short < self.velocity_slowdown_threshold * v_long
    }

    fn counter_density(&self, position: &Position, mid: Decimal) -> bool {
        let resistance_side = match position.direction {
            Direction::Long => Side::Ask,
            Direction::Short => Side::Bid,
        };
        self.density
            .densities_for_symbol(&position.symbol, resistance_side)
            .into_iter()
            .any(|d| match position.direction {
                Direction::Long => d.price_level > mid,
                Direction::Short => d.price_level < mid,
            })
    }

    fn aggressive_reversal(&self, position: &Position, book: &OrderBook) -> bool {
        let bid = book.total_bid_volume();
        let ask = book.total_ask_volume();
        if ask.is_zero() {
            return false;
        }
        let current_ratio = bid / ask;

        let mut map = self.trailing_imbalance.write();
        let history = map.entry(position.symbol.clone()).or_default();
        history.push((Utc::now(), current_ratio));
        let cutoff = Utc::now() - Duration::seconds(IMBALANCE_TRAILING_WINDOW_SEC);
        history.retain(|(ts, _)| *ts >= cutoff);
        if history.len() < 2 {
            return false;
        }
        let mean: Decimal = history.iter().map(|(_, r)| *r).sum::<Decimal>() / Decimal::from(history.len());
        if mean.is_zero() {
            return false;
        }

        match position.direction {
            // Against a LONG means the book is turning ask-heavy: ratio falling.
            Direction::Long => mean / current_ratio.max(Decimal::new(1, 6)) >= self.imbalance_change_threshold,
            // Against a SHORT means the book is turning bid-heavy: ratio rising.
            Direction::Short => current_ratio / mean.max(Decimal::new(1, 6)) >= self.imbalance_change_threshold,
        }
    }

    fn return_to_range(&self, position: &Position, mid: Decimal) -> bool {
        match position.direction {
            Direction::Long => mid <= position.density_price,
            Direction::Short => mid >= position.density_price,
        }
    }

    fn record_imbalance(&self, _symbol: &str, _book: &OrderBook) {
        // History Buffers already record mid/volume samples on every book
        // update upstream; this monitor only consumes them.
    }

    async fn close(&self, position: &Position, reason: ExitReason) {
        match self
            .execution
            .close_position(&position.symbol, position.direction, position.size)
            .await
        {
            Ok(fill_price) => match self.registry.close(&position.symbol, fill_price, reason).await {
                Ok(_) => info!(symbol = %position.symbol, exit_reason = reason.as_str(), "position closed"),
                Err(e) => error!(symbol = %position.symbol, error = %e, "failed to persist position close"),
            },
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "reduce-only close failed, position remains open under its stop; retrying next cycle");
            }
        }
    }
}

fn opposite_entry_side(position: &Position) -> Side {
    match position.direction {
        Direction::Long => Side::Bid,
        Direction::Short => Side::Ask,
    }
}

fn velocity(points: &[crate::history::MidPoint]) -> Decimal {
    if points.len() < 2 {
        return Decimal::ZERO;
    }
    let first = points.first().unwrap();
    let last = points.last().unwrap();
    let dt = (last.ts - first.ts).num_milliseconds();
    if dt == 0 {
        return Decimal::ZERO;
    }
    ((last.mid - first.mid).abs() / Decimal::from(dt)).normalize()
}

#[cfg(test)]
mod tests {
    use super::velocity;
    use crate::history::MidPoint;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn velocity_is_zero_for_single_sample() {
        let points = vec![MidPoint { ts: Utc::now(), mid: dec!(100) }];
        assert_eq!(velocity(&points), rust_decimal::Decimal::ZERO);
    }

    #[test]
    fn velocity_increases_with_larger_price_move() {
        let t0 = Utc::now();
        let slow = vec![
            MidPoint { ts: t0, mid: dec!(100) },
            MidPoint { ts: t0 + chrono::Duration::milliseconds(1000), mid: dec!(100.1) },
        ];
        let fast = vec![
            MidPoint { ts: t0, mid: dec!(100) },
            MidPoint { ts: t0 + chrono::Duration::milliseconds(1000), mid: dec!(101) },
        ];
        assert!(velocity(&fast) > velocity(&slow));
    }
}
