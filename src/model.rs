//! Core domain types shared across the trading engine: order book levels,
//! densities, trend, signals, positions, and per-symbol parameters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the book a level, density, or position sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Ask => "ASK",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Trade direction, independent of how the signal that produced it was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// +1 for LONG, -1 for SHORT; used by pnl sign conventions.
    pub fn sign(self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => -Decimal::ONE,
        }
    }
}

/// A single price/volume point on one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, volume: Decimal) -> Self {
        Self { price, volume }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.volume
    }
}

/// A consistent top-N view of one symbol's order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn total_bid_volume(&self) -> Decimal {
        self.bids.iter().map(|l| l.volume).sum()
    }

    pub fn total_ask_volume(&self) -> Decimal {
        self.asks.iter().map(|l| l.volume).sum()
    }

    /// Imbalance ratio for the given side over its opposite (bid/ask or ask/bid).
    /// Returns None when the denominator side has no volume.
    pub fn imbalance(&self, numerator: Side) -> Option<Decimal> {
        let (num, den) = match numerator {
            Side::Bid => (self.total_bid_volume(), self.total_ask_volume()),
            Side::Ask => (self.total_ask_volume(), self.total_bid_volume()),
        };
        if den.is_zero() {
            return None;
        }
        Some(num / den)
    }

    /// True iff the book satisfies the structural invariants from the data model:
    /// best_bid < best_ask, no duplicate prices per side, depth within bound.
    pub fn is_well_formed(&self, max_depth: usize) -> bool {
        if self.bids.len() > max_depth || self.asks.len() > max_depth {
            return false;
        }
        if let (Some(b), Some(a)) = (self.best_bid(), self.best_ask()) {
            if b.price >= a.price {
                return false;
            }
        }
        !has_duplicate_prices(&self.bids) && !has_duplicate_prices(&self.asks)
    }
}

fn has_duplicate_prices(levels: &[PriceLevel]) -> bool {
    let mut seen = std::collections::HashSet::with_capacity(levels.len());
    for l in levels {
        if !seen.insert(l.price) {
            return true;
        }
    }
    false
}

/// A density record: a price level (or cluster) whose volume has satisfied
/// the absolute/relative/percent-of-total criteria together at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Density {
    pub symbol: String,
    pub side: Side,
    pub price_level: Decimal,
    pub initial_volume: Decimal,
    pub current_volume: Decimal,
    pub appeared_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub disappeared_at: Option<DateTime<Utc>>,
    pub is_cluster: bool,
    /// Consecutive scans in which the absolute criterion has failed; reset on pass.
    pub consecutive_absolute_failures: u32,
}

impl Density {
    pub fn key(&self) -> (String, Side, Decimal) {
        (self.symbol.clone(), self.side, self.price_level)
    }

    /// max(0, (initial - current) / initial * 100). Computed only on read, never stored.
    pub fn erosion_percent(&self) -> Decimal {
        if self.initial_volume.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (self.initial_volume - self.current_volume) / self.initial_volume * Decimal::ONE_HUNDRED;
        raw.max(Decimal::ZERO)
    }

    pub fn is_active(&self) -> bool {
        self.disappeared_at.is_none()
    }
}

/// Per-symbol directional read, derived from 24h change and book imbalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub symbol: String,
    pub direction: TrendDirection,
    pub computed_at: DateTime<Utc>,
}

/// Candidate signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Breakout,
    Bounce,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Breakout => "BREAKOUT",
            SignalKind::Bounce => "BOUNCE",
        }
    }
}

/// A candidate trade produced by the Signal Generator, still to pass the Validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: uuid::Uuid,
    pub symbol: String,
    pub kind: SignalKind,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    /// The density price this signal was derived from (value copy, never a shared reference).
    pub density_price: Decimal,
    pub density_side: Side,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

impl Signal {
    pub const MAX_AGE: chrono::Duration = chrono::Duration::seconds(60);

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > Self::MAX_AGE
    }
}

/// Exhaustive set of reasons a position can close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    DensityErosion,
    Emergency,
    MomentumSlowdown,
    CounterDensity,
    AggressiveReversal,
    ReturnToRange,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::DensityErosion => "DENSITY_EROSION",
            ExitReason::Emergency => "EMERGENCY",
            ExitReason::MomentumSlowdown => "MOMENTUM_SLOWDOWN",
            ExitReason::CounterDensity => "COUNTER_DENSITY",
            ExitReason::AggressiveReversal => "AGGRESSIVE_REVERSAL",
            ExitReason::ReturnToRange => "RETURN_TO_RANGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// A live or recently-closed position, mirrored to the `trades` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: uuid::Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: u32,
    pub signal_kind: SignalKind,
    pub density_price: Decimal,
    pub stop_loss: Decimal,
    pub breakeven_moved: bool,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<Decimal>,
}

impl Position {
    /// Unrealized pnl percent at the given mark price, signed by direction.
    pub fn unrealized_pnl_percent(&self, mark: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (mark - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED * self.direction.sign()
    }

    pub fn realized_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.size * self.direction.sign()
    }
}

/// Per-symbol tunable thresholds, cached in memory from the `coin_parameters` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinParameters {
    pub symbol: String,
    pub density_threshold_abs: Decimal,
    pub relative_multiplier: Decimal,
    pub density_threshold_percent: Decimal,
    pub cluster_range_percent: Decimal,
    pub breakout_erosion_percent: Decimal,
    pub breakout_min_stop_loss_percent: Decimal,
    pub bounce_density_stable_percent: Decimal,
    pub bounce_density_erosion_exit_percent: Decimal,
    pub bounce_stop_loss_behind_density_percent: Decimal,
    pub breakeven_profit_percent: Decimal,
    pub touch_tolerance_percent: Decimal,
    /// Smallest order-quantity increment the exchange accepts for this symbol;
    /// execution floors computed position size down to a multiple of this.
    pub lot_step: Decimal,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(bid: Decimal, ask: Decimal) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(bid, dec!(1))],
            asks: vec![PriceLevel::new(ask, dec!(1))],
        }
    }

    #[test]
    fn mid_price_averages_best_bid_and_ask() {
        let b = book(dec!(100), dec!(102));
        assert_eq!(b.mid_price(), Some(dec!(101)));
    }

    #[test]
    fn well_formed_rejects_crossed_book() {
        let b = book(dec!(102), dec!(100));
        assert!(!b.is_well_formed(50));
    }

    #[test]
    fn erosion_percent_clamps_at_zero_when_volume_grows() {
        let d = Density {
            symbol: "BTCUSDT".into(),
            side: Side::Ask,
            price_level: dec!(50000),
            initial_volume: dec!(10),
            current_volume: dec!(12),
            appeared_at: Utc::now(),
            last_seen_at: Utc::now(),
            disappeared_at: None,
            is_cluster: false,
            consecutive_absolute_failures: 0,
        };
        assert_eq!(d.erosion_percent(), Decimal::ZERO);
    }

    #[test]
    fn erosion_percent_computes_from_initial_and_current_volume() {
        let d = Density {
            symbol: "BTCUSDT".into(),
            side: Side::Ask,
            price_level: dec!(50000),
            initial_volume: dec!(10),
            current_volume: dec!(6.5),
            appeared_at: Utc::now(),
            last_seen_at: Utc::now(),
            disappeared_at: None,
            is_cluster: false,
            consecutive_absolute_failures: 0,
        };
        assert_eq!(d.erosion_percent(), dec!(35));
    }
}
