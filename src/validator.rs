//! Signal Validator: the fixed ordered gate, first failure rejects.
//! Gate-chain style grounded on `vault/unified_15m_strategy.rs::on_order`;
//! aggregate-exposure/per-position checks grounded on
//! `risk.rs::RiskManager::classify_risk`.

use crate::density::DensityTracker;
use crate::model::{CoinParameters, Direction, OrderBook, Position, Signal};
use chrono::Utc;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    SymbolDisabled,
    SymbolNotActive,
    SignalExpired,
    SignalAlreadyConsumed,
    MaxConcurrentPositions,
    DuplicateDirection,
    StopLossTooClose,
    EntryTooFarFromMid,
    DensityGone,
    InsufficientMargin,
    ExposureExceeded,
    PerPositionExceeded,
}

pub struct ValidationContext<'a> {
    pub params: &'a CoinParameters,
    pub active_symbols: &'a [String],
    pub open_positions: &'a [Position],
    pub density_tracker: &'a DensityTracker,
    pub available_balance: Decimal,
    pub book: &'a OrderBook,
    pub max_concurrent_positions: usize,
    pub max_exposure_percent: Decimal,
    pub max_per_position_percent: Decimal,
    pub position_size_usdt: Decimal,
    pub leverage: u32,
}

const MIN_STOP_DISTANCE_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05%
const MAX_ENTRY_MID_DRIFT_PERCENT: Decimal = Decimal::from_parts(1, 0, 0, false, 0); // 1%

/// Runs the 10 ordered checks plus the two aggregate risk checks; returns the
/// first failure, or Ok(required_margin_checked) on full pass.
pub fn validate(signal: &Signal, ctx: &ValidationContext) -> Result<(), RejectionReason> {
    if !ctx.params.enabled {
        return Err(RejectionReason::SymbolDisabled);
    }
    if !ctx.active_symbols.iter().any(|s| s == &signal.symbol) {
        return Err(RejectionReason::SymbolNotActive);
    }
    if signal.is_expired(Utc::now()) {
        return Err(RejectionReason::SignalExpired);
    }
    if signal.consumed {
        return Err(RejectionReason::SignalAlreadyConsumed);
    }
    if ctx.open_positions.len() >= ctx.max_concurrent_positions {
        return Err(RejectionReason::MaxConcurrentPositions);
    }
    if ctx
        .open_positions
        .iter()
        .any(|p| p.symbol == signal.symbol && p.direction == signal.direction)
    {
        return Err(RejectionReason::DuplicateDirection);
    }

    let stop_distance_pct = (signal.stop_loss - signal.entry_price).abs() / signal.entry_price * Decimal::ONE_HUNDRED;
    if stop_distance_pct < MIN_STOP_DISTANCE_PERCENT {
        return Err(RejectionReason::StopLossTooClose);
    }

    let mid = ctx.book.mid_price().unwrap_or(signal.entry_price);
    let entry_drift_pct = (signal.entry_price - mid).abs() / mid * Decimal::ONE_HUNDRED;
    if entry_drift_pct >= MAX_ENTRY_MID_DRIFT_PERCENT {
        return Err(RejectionReason::EntryTooFarFromMid);
    }

    if !ctx
        .density_tracker
        .is_present(&signal.symbol, signal.density_side, signal.density_price)
    {
        return Err(RejectionReason::DensityGone);
    }

    let leverage = Decimal::from(ctx.leverage);
    let required_margin = ctx.position_size_usdt / leverage;
    if required_margin > ctx.available_balance {
        return Err(RejectionReason::InsufficientMargin);
    }

    let existing_notional: Decimal = ctx
        .open_positions
        .iter()
        .map(|p| p.entry_price * p.size)
        .sum();
    let new_notional = ctx.position_size_usdt * leverage;
    let aggregate_after = existing_notional + new_notional;
    if aggregate_after > ctx.max_exposure_percent / Decimal::ONE_HUNDRED * ctx.available_balance {
        return Err(RejectionReason::ExposureExceeded);
    }
    if new_notional > ctx.max_per_position_percent / Decimal::ONE_HUNDRED * ctx.available_balance {
        return Err(RejectionReason::PerPositionExceeded);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PriceLevel, SignalKind};
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
            enabled: false,
        }
    }

    fn signal() -> Signal {
        Signal {
            id: uuid::Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            kind: SignalKind::Breakout,
            direction: Direction::Long,
            entry_price: dec!(50005),
            stop_loss: dec!(49950),
            density_price: dec!(50000),
            density_side: crate::model::Side::Ask,
            priority: 1,
            created_at: Utc::now(),
            consumed: false,
        }
    }

    fn book() -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(50004.5), dec!(1))],
            asks: vec![PriceLevel::new(dec!(50005.5), dec!(1))],
        }
    }

    #[test]
    fn disabled_symbol_rejects_first() {
        let density_tracker = DensityTracker::new();
        let ctx = ValidationContext {
            params: &params(),
            active_symbols: &["BTCUSDT".to_string()],
            open_positions: &[],
            density_tracker: &density_tracker,
            available_balance: dec!(10000),
            book: &book(),
            max_concurrent_positions: 5,
            max_exposure_percent: dec!(50),
            max_per_position_percent: dec!(20),
            position_size_usdt: dec!(100),
            leverage: 5,
        };
        assert_eq!(validate(&signal(), &ctx), Err(RejectionReason::SymbolDisabled));
    }

    #[test]
    fn rejection_is_idempotent() {
        let density_tracker = DensityTracker::new();
        let ctx = ValidationContext {
            params: &params(),
            active_symbols: &["BTCUSDT".to_string()],
            open_positions: &[],
            density_tracker: &density_tracker,
            available_balance: dec!(10000),
            book: &book(),
            max_concurrent_positions: 5,
            max_exposure_percent: dec!(50),
            max_per_position_percent: dec!(20),
            position_size_usdt: dec!(100),
            leverage: 5,
        };
        let sig = signal();
        assert_eq!(validate(&sig, &ctx), validate(&sig, &ctx));
    }
}
