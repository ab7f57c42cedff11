//! Density Tracker: scans each book update for price levels/clusters that
//! simultaneously clear the absolute, relative, and percent-of-total
//! criteria, and maintains the keyed lifecycle record for each. No corpus
//! repo models "density" directly; the keyed-map-with-atomics lifecycle
//! idiom is carried over from `scrapers/binance_book_ticker.rs::SymbolState`
//! and `vault/unified_15m_strategy.rs::AssetState`.

use crate::model::{CoinParameters, Density, OrderBook, PriceLevel, Side};
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

const NEIGHBOR_WINDOW: usize = 5;
const DISAPPEAR_AFTER_CONSECUTIVE_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub enum DensityEvent {
    Appeared(Density),
    Updated(Density),
    Disappeared(Density),
}

type Key = (String, Side, Decimal);

#[derive(Clone)]
pub struct DensityTracker {
    map: Arc<RwLock<HashMap<Key, Density>>>,
}

impl DensityTracker {
    pub fn new() -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, symbol: &str, side: Side, price_level: Decimal) -> Option<Density> {
        self.map
            .read()
            .get(&(symbol.to_string(), side, price_level))
            .cloned()
    }

    pub fn is_present(&self, symbol: &str, side: Side, price_level: Decimal) -> bool {
        self.get(symbol, side, price_level)
            .map(|d| d.is_active())
            .unwrap_or(false)
    }

    /// Returns the density on the given side whose price_level is at or
    /// beyond `boundary` relative to `direction` (used by the Position
    /// Monitor's COUNTER_DENSITY check).
    pub fn densities_for_symbol(&self, symbol: &str, side: Side) -> Vec<Density> {
        self.map
            .read()
            .values()
            .filter(|d| d.symbol == symbol && d.side == side && d.is_active())
            .cloned()
            .collect()
    }

    /// Runs the three-criteria scan for one book update and returns the
    /// lifecycle events produced. Must be called with the events routed
    /// through a single per-symbol producer path to preserve FIFO ordering.
    pub fn on_book_update(&self, book: &OrderBook, params: &CoinParameters, tick: Decimal) -> Vec<DensityEvent> {
        let mut events = Vec::new();
        events.extend(self.scan_side(&book.symbol, Side::Bid, &book.bids, params, tick));
        events.extend(self.scan_side(&book.symbol, Side::Ask, &book.asks, params, tick));
        events
    }

    fn scan_side(
        &self,
        symbol: &str,
        side: Side,
        levels: &[PriceLevel],
        params: &CoinParameters,
        tick: Decimal,
    ) -> Vec<DensityEvent> {
        if levels.is_empty() {
            return Vec::new();
        }
        let total: Decimal = levels.iter().map(|l| l.volume).sum();

        // Creation-eligible: passes all three criteria simultaneously.
        let mut qualifying: HashMap<Decimal, (Decimal, bool)> = HashMap::new(); // price -> (volume, is_cluster)
        // Continuation-eligible: clears the absolute criterion alone. A density
        // stays alive on this alone even if it stops clearing the relative or
        // percent-of-total criteria; only a miss on the absolute criterion
        // counts toward disappearance.
        let mut abs_pass: HashMap<Decimal, Decimal> = HashMap::new(); // price -> volume

        // Single-level candidates.
        for (i, level) in levels.iter().enumerate() {
            if total.is_zero() {
                continue;
            }
            let rounded = round_to_tick(level.price, tick);
            let abs_ok = level.volume * level.price >= params.density_threshold_abs;
            if abs_ok {
                abs_pass.insert(rounded, level.volume);
            }
            if abs_ok && passes_three_criteria(level.volume, level.price, total, levels, i, params) {
                qualifying.insert(rounded, (level.volume, false));
            }
        }

        // Cluster candidates: contiguous runs within cluster_range_percent of each other.
        for cluster in find_clusters(levels, params.cluster_range_percent) {
            let cluster_volume: Decimal = cluster.iter().map(|l| l.volume).sum();
            if cluster_volume.is_zero() || total.is_zero() {
                continue;
            }
            let weighted_sum: Decimal = cluster.iter().map(|l| l.price * l.volume).sum();
            let centroid = weighted_sum / cluster_volume;
            let rounded = round_to_tick(centroid, tick);
            let abs_ok = centroid * cluster_volume >= params.density_threshold_abs;
            if abs_ok {
                // Tie-break: cluster supersedes a single level at the same tick.
                abs_pass.insert(rounded, cluster_volume);
            }
            let percent_ok =
                cluster_volume / total * Decimal::ONE_HUNDRED >= params.density_threshold_percent;
            // Relative criterion for a cluster is evaluated against the same
            // neighbor window as a single level would use, anchored at the
            // cluster's first member index.
            let anchor_idx = levels.iter().position(|l| l.price == cluster[0].price).unwrap_or(0);
            let relative_ok = cluster_volume
                >= params.relative_multiplier * neighbor_mean(levels, anchor_idx, cluster.len());
            if abs_ok && percent_ok && relative_ok {
                qualifying.insert(rounded, (cluster_volume, true));
            }
        }

        self.reconcile(symbol, side, qualifying, abs_pass)
    }

    fn reconcile(
        &self,
        symbol: &str,
        side: Side,
        qualifying: HashMap<Decimal, (Decimal, bool)>,
        abs_pass: HashMap<Decimal, Decimal>,
    ) -> Vec<DensityEvent> {
        let mut events = Vec::new();
        let now = Utc::now();
        let mut map = self.map.write();

        // Create or fully refresh entries for everything that clears all
        // three criteria this scan.
        for (price, (volume, is_cluster)) in &qualifying {
            let key = (symbol.to_string(), side, *price);
            match map.get_mut(&key) {
                Some(existing) => {
                    existing.current_volume = *volume;
                    existing.last_seen_at = now;
                    existing.is_cluster = *is_cluster;
                    existing.consecutive_absolute_failures = 0;
                    if existing.disappeared_at.is_some() {
                        existing.disappeared_at = None;
                    }
                    events.push(DensityEvent::Updated(existing.clone()));
                }
                None => {
                    let density = Density {
                        symbol: symbol.to_string(),
                        side,
                        price_level: *price,
                        initial_volume: *volume,
                        current_volume: *volume,
                        appeared_at: now,
                        last_seen_at: now,
                        disappeared_at: None,
                        is_cluster: *is_cluster,
                        consecutive_absolute_failures: 0,
                    };
                    map.insert(key, density.clone());
                    events.push(DensityEvent::Appeared(density));
                }
            }
        }

        // Existing densities that didn't clear all three criteria this scan
        // still survive on the absolute criterion alone: refresh current_volume
        // and reset the failure counter, but never create a new density here.
        for (key, density) in map.iter_mut() {
            if key.0 != symbol || key.1 != side || qualifying.contains_key(&key.2) {
                continue;
            }
            if density.disappeared_at.is_some() {
                continue;
            }
            if let Some(volume) = abs_pass.get(&key.2) {
                density.current_volume = *volume;
                density.last_seen_at = now;
                density.consecutive_absolute_failures = 0;
                events.push(DensityEvent::Updated(density.clone()));
            }
        }

        // Anything previously tracked on this (symbol, side) that misses even
        // the absolute criterion gets a consecutive-failure tick; two in a row
        // disappears it.
        for (key, density) in map.iter_mut() {
            if key.0 != symbol || key.1 != side || abs_pass.contains_key(&key.2) {
                continue;
            }
            if density.disappeared_at.is_some() {
                continue;
            }
            density.consecutive_absolute_failures += 1;
            if density.consecutive_absolute_failures >= DISAPPEAR_AFTER_CONSECUTIVE_FAILURES {
                density.disappeared_at = Some(now);
                events.push(DensityEvent::Disappeared(density.clone()));
            }
        }

        events
    }
}

impl Default for DensityTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn passes_three_criteria(
    volume: Decimal,
    price: Decimal,
    total: Decimal,
    levels: &[PriceLevel],
    idx: usize,
    params: &CoinParameters,
) -> bool {
    let abs_ok = volume * price >= params.density_threshold_abs;
    let percent_ok = volume / total * Decimal::ONE_HUNDRED >= params.density_threshold_percent;
    let relative_ok = volume >= params.relative_multiplier * neighbor_mean(levels, idx, 1);
    abs_ok && percent_ok && relative_ok
}

/// Mean volume of up to `NEIGHBOR_WINDOW` nearest levels by index proximity,
/// excluding the `skip_len`-wide span starting at `center` (the level or
/// cluster itself).
fn neighbor_mean(levels: &[PriceLevel], center: usize, skip_len: usize) -> Decimal {
    let excluded_end = center + skip_len;
    let mut distances: Vec<usize> = (0..levels.len())
        .filter(|i| *i < center || *i >= excluded_end)
        .collect();
    distances.sort_by_key(|i| (*i as i64 - center as i64).unsigned_abs());
    let neighbors: Vec<Decimal> = distances
        .into_iter()
        .take(NEIGHBOR_WINDOW)
        .map(|i| levels[i].volume)
        .collect();
    if neighbors.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = neighbors.iter().sum();
    sum / Decimal::from(neighbors.len())
}

/// Groups contiguous levels whose price stays within `range_percent` of the
/// first member of the running group.
fn find_clusters(levels: &[PriceLevel], range_percent: Decimal) -> Vec<Vec<PriceLevel>> {
    let mut clusters = Vec::new();
    let mut current: Vec<PriceLevel> = Vec::new();

    for level in levels {
        if let Some(anchor) = current.first() {
            let pct = (level.price - anchor.price).abs() / anchor.price * Decimal::ONE_HUNDRED;
            if pct <= range_percent {
                current.push(*level);
                continue;
            }
            if current.len() > 1 {
                clusters.push(current.clone());
            }
            current.clear();
        }
        current.push(*level);
    }
    if current.len() > 1 {
        clusters.push(current);
    }
    clusters
}

fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).round() * tick
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn book_with_ask_density() -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(49990), dec!(1))],
            asks: vec![
                PriceLevel::new(dec!(50000), dec!(10)),
                PriceLevel::new(dec!(50010), dec!(0.2)),
                PriceLevel::new(dec!(50020), dec!(0.2)),
                PriceLevel::new(dec!(50030), dec!(0.2)),
                PriceLevel::new(dec!(50040), dec!(0.2)),
                PriceLevel::new(dec!(50050), dec!(0.2)),
            ],
        }
    }

    #[test]
    fn appearing_density_sets_initial_volume() {
        let tracker = DensityTracker::new();
        let events = tracker.on_book_update(&book_with_ask_density(), &params(), dec!(1));
        let appeared = events.iter().any(|e| matches!(e, DensityEvent::Appeared(d) if d.side == Side::Ask && d.price_level == dec!(50000)));
        assert!(appeared);
    }

    #[test]
    fn two_consecutive_misses_marks_disappeared() {
        let tracker = DensityTracker::new();
        tracker.on_book_update(&book_with_ask_density(), &params(), dec!(1));

        let thin = OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(49990), dec!(1))],
            asks: vec![
                PriceLevel::new(dec!(50000), dec!(0.01)),
                PriceLevel::new(dec!(50010), dec!(0.2)),
                PriceLevel::new(dec!(50020), dec!(0.2)),
            ],
        };
        tracker.on_book_update(&thin, &params(), dec!(1));
        let events = tracker.on_book_update(&thin, &params(), dec!(1));
        let disappeared = events
            .iter()
            .any(|e| matches!(e, DensityEvent::Disappeared(d) if d.price_level == dec!(50000)));
        assert!(disappeared);
    }

    #[test]
    fn round_to_tick_rounds_to_nearest_step() {
        assert_eq!(round_to_tick(dec!(50000.37), dec!(0.5)), dec!(50000.5));
    }

    #[test]
    fn survives_on_absolute_criterion_alone() {
        let tracker = DensityTracker::new();
        tracker.on_book_update(&book_with_ask_density(), &params(), dec!(1));

        // Volume at 50000 drops to 2.5 (notional 125000, still clears the
        // absolute threshold) while the rest of the book grows enough that
        // it no longer clears the relative or percent-of-total criteria.
        let eroded = OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(49990), dec!(1))],
            asks: vec![
                PriceLevel::new(dec!(50000), dec!(2.5)),
                PriceLevel::new(dec!(50010), dec!(50)),
                PriceLevel::new(dec!(50020), dec!(50)),
                PriceLevel::new(dec!(50030), dec!(50)),
                PriceLevel::new(dec!(50040), dec!(50)),
                PriceLevel::new(dec!(50050), dec!(50)),
            ],
        };
        let events = tracker.on_book_update(&eroded, &params(), dec!(1));

        let disappeared = events
            .iter()
            .any(|e| matches!(e, DensityEvent::Disappeared(d) if d.price_level == dec!(50000)));
        assert!(!disappeared, "absolute-only survivor must not disappear");

        let updated_volume = events.iter().find_map(|e| match e {
            DensityEvent::Updated(d) if d.price_level == dec!(50000) => Some(d.current_volume),
            _ => None,
        });
        assert_eq!(updated_volume, Some(dec!(2.5)), "current_volume must track erosion");
    }
}
