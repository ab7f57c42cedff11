//! Orchestrator: startup sequencing, task-graph ownership, and graceful
//! shutdown. `tokio::select!` racing every spawned loop against
//! `tokio::signal::ctrl_c()` is grounded directly on
//! `src/bin/route_quality_monitor.rs`'s main loop.

use crate::config::EngineConfig;
use crate::density::DensityTracker;
use crate::exchange::ExchangeClient;
use crate::execution::{ExecutionCore, ExecutionOutcome};
use crate::history::HistoryBuffers;
use crate::market_feed::MarketFeed;
use crate::model::{CoinParameters, Direction, OrderBook};
use crate::monitor::PositionMonitor;
use crate::registry::PositionRegistry;
use crate::safety::{SafetyState, SafetySupervisor};
use crate::signal_gen::SignalGenerator;
use crate::trend::TrendClassifier;
use crate::validator::{self, ValidationContext};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// External symbol-ranking/24h-change collaborator, specified only at its
/// interface: a single call returning an ordered active-symbol list, plus a
/// per-symbol 24h change percent. Out of scope beyond this boundary.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_active_symbols(&self) -> Result<Vec<String>>;
    async fn fetch_24h_change(&self, symbol: &str) -> Result<Decimal>;
}

const SIGNAL_LOOP_INTERVAL_SECS: u64 = 10;
const MONITOR_LOOP_INTERVAL_SECS: u64 = 1;

/// Heuristic tick size used for density-identity rounding when no explicit
/// tick metadata is configured for a symbol; not part of the persisted
/// coin-parameters schema.
const DEFAULT_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Sane enabled-by-default coin parameters for a symbol with no persisted
/// row yet. Seeded once at bootstrap (and again for any symbol newly added
/// to the active set) so the signal pipeline never silently stalls on a
/// missing entry; operators tune these afterward by editing the
/// `coin_parameters` table directly.
fn default_coin_parameters(symbol: &str) -> CoinParameters {
    use rust_decimal_macros::dec;
    CoinParameters {
        symbol: symbol.to_string(),
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

pub struct Orchestrator<C: ExchangeClient, M: MarketDataSource> {
    config: EngineConfig,
    client: Arc<C>,
    market_data: Arc<M>,
    registry: Arc<PositionRegistry>,
    market_feed: MarketFeed,
    history: HistoryBuffers,
    density: DensityTracker,
    trend: TrendClassifier,
    signal_gen: SignalGenerator,
    execution: Arc<ExecutionCore<C>>,
    safety: Arc<SafetySupervisor<C>>,
    coin_params: Arc<RwLock<HashMap<String, CoinParameters>>>,
    active_symbols: Arc<RwLock<Vec<String>>>,
    /// (symbol, direction) pairs with an execution currently in flight, so a
    /// density that still qualifies on the next signal_cycle tick (before the
    /// first execution registers its position) doesn't fire a second,
    /// overlapping order for the same side.
    in_flight: Arc<RwLock<HashSet<(String, Direction)>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<C: ExchangeClient + 'static, M: MarketDataSource + 'static> Orchestrator<C, M> {
    pub async fn bootstrap(config: EngineConfig, client: Arc<C>, market_data: Arc<M>) -> Result<Self> {
        let registry = Arc::new(PositionRegistry::open(&config.database_path)?);
        registry.reconcile(client.as_ref()).await?;

        let active = market_data.fetch_active_symbols().await.unwrap_or_default();
        info!(count = active.len(), "fetched initial active symbol set");

        let mut coin_params = registry.load_coin_parameters().await?;
        for symbol in &active {
            if !coin_params.contains_key(symbol) {
                let defaults = default_coin_parameters(symbol);
                registry.upsert_coin_parameters(&defaults).await?;
                coin_params.insert(symbol.clone(), defaults);
            }
        }

        let (market_feed, _ws_handle) = MarketFeed::spawn(config.websocket.clone());
        for symbol in &active {
            market_feed.subscribe(symbol).await;
        }

        let history = HistoryBuffers::new();
        let density = DensityTracker::new();
        let trend = TrendClassifier::new(
            config.strategy.trend_change_threshold_percent,
            config.strategy.trend_imbalance_ratio,
            chrono::Duration::seconds(config.strategy.trend_refresh_interval.as_secs() as i64),
        );
        let signal_gen = SignalGenerator::new(history.clone());
        let execution = Arc::new(ExecutionCore::new(
            client.clone(),
            crate::exchange::RateGate::new(20),
        ));
        let safety = Arc::new(SafetySupervisor::new(
            config.safety.clone(),
            config.trading.max_exposure_percent,
            registry.clone(),
            market_feed.clone(),
            execution.clone(),
        ));

        let (shutdown_tx, _rx) = watch::channel(false);

        Ok(Self {
            config,
            client,
            market_data,
            registry,
            market_feed,
            history,
            density,
            trend,
            signal_gen,
            execution,
            safety,
            coin_params: Arc::new(RwLock::new(coin_params)),
            active_symbols: Arc::new(RwLock::new(active)),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            shutdown_tx,
        })
    }

    /// Runs the three cadence loops plus the ctrl-c listener, returning once
    /// any branch resolves (including EMERGENCY shutdown).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let signal_loop = tokio::spawn(self.clone().run_signal_loop());
        let monitor_loop = tokio::spawn(self.clone().run_monitor_loop());
        let safety_loop = tokio::spawn(self.clone().run_safety_loop());
        let market_data_loop = tokio::spawn(self.clone().run_market_data_loop());
        let snapshot_loop = tokio::spawn(self.clone().run_snapshot_loop());

        tokio::select! {
            _ = signal_loop => info!("signal loop exited"),
            _ = monitor_loop => info!("monitor loop exited"),
            _ = safety_loop => info!("safety loop exited"),
            _ = market_data_loop => info!("market data loop exited"),
            _ = snapshot_loop => info!("snapshot loop exited"),
            _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.market_feed.shutdown();
        if self.safety.is_emergency() {
            self.safety.force_close_all().await;
        }
    }

    async fn run_signal_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(SIGNAL_LOOP_INTERVAL_SECS));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.safety.state() != SafetyState::Emergency {
                        self.signal_cycle().await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Periodically archives the full current book for every active symbol
    /// into `orderbook_snapshots`, cadenced off `WebsocketConfig.snapshot_interval`.
    async fn run_snapshot_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.websocket.snapshot_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let symbols = self.active_symbols.read().clone();
                    for symbol in symbols {
                        if let Some(book) = self.market_feed.current_book(&symbol).await {
                            if let Err(e) = self.registry.save_orderbook_snapshot(&book).await {
                                warn!(symbol = %symbol, error = %e, "failed to save orderbook snapshot");
                            }
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn signal_cycle(&self) {
        let blocked = self.safety.state() == SafetyState::SoftStop;
        let symbols = self.active_symbols.read().clone();
        for symbol in symbols {
            let Some(book) = self.market_feed.current_book(&symbol).await else {
                continue;
            };
            let Some(mid) = book.mid_price() else { continue };
            self.history
                .record(&symbol, mid, book.total_bid_volume(), book.total_ask_volume());

            let Some(params) = self.coin_params.read().get(&symbol).cloned() else {
                continue;
            };
            if !params.enabled {
                continue;
            }

            let events = self.density.on_book_update(&book, &params, DEFAULT_TICK);
            for event in &events {
                if let Err(e) = self.registry.record_density_event(event).await {
                    warn!(symbol = %symbol, error = %e, "failed to record density event");
                }
            }
            if blocked {
                continue;
            }
            let trend = self.trend.trend(&symbol, Some(&book));

            for event in &events {
                let Some(signal) = self.signal_gen.evaluate(event, &trend, &book, &params) else {
                    continue;
                };
                self.try_execute(signal, &params, &book).await;
            }
        }
    }

    async fn try_execute(&self, mut signal: crate::model::Signal, params: &CoinParameters, book: &OrderBook) {
        let balance = match self.client.get_wallet_balance().await {
            Ok(b) => b.wallet_balance,
            Err(e) => {
                warn!(error = %e, "could not fetch balance for validation, skipping signal");
                return;
            }
        };
        let active = self.active_symbols.read().clone();
        let open_positions = self.registry.open_positions();

        // An execution already in flight for this (symbol, direction) marks
        // the signal consumed up front: validate() rejects it rather than
        // racing a second market order before the first one's position is
        // registered.
        let key = (signal.symbol.clone(), signal.direction);
        if self.in_flight.read().contains(&key) {
            signal.consumed = true;
        }

        let ctx = ValidationContext {
            params,
            active_symbols: &active,
            open_positions: &open_positions,
            density_tracker: &self.density,
            available_balance: balance,
            book,
            max_concurrent_positions: self.config.trading.max_concurrent_positions,
            max_exposure_percent: self.config.trading.max_exposure_percent,
            max_per_position_percent: self.config.trading.max_per_position_percent,
            position_size_usdt: self.config.trading.position_size_usdt,
            leverage: self.config.trading.leverage,
        };

        if let Err(reason) = validator::validate(&signal, &ctx) {
            info!(symbol = %signal.symbol, ?reason, "signal rejected");
            return;
        }

        self.in_flight.write().insert(key.clone());
        let outcome = self
            .execution
            .execute(
                &signal,
                self.config.trading.leverage,
                self.config.trading.position_size_usdt,
                params.lot_step,
            )
            .await;
        self.in_flight.write().remove(&key);

        match outcome {
            Ok(ExecutionOutcome::Confirmed(position)) => {
                info!(symbol = %position.symbol, "position confirmed");
                if let Err(e) = self.registry.create_open(position).await {
                    error!(error = %e, "failed to persist confirmed position");
                }
            }
            Ok(ExecutionOutcome::ForceClosed { symbol, .. }) => {
                warn!(symbol, "execution force-closed after stop-set failure");
            }
            Err(e) => {
                error!(symbol = %signal.symbol, error = %e, "execution failed");
            }
        }
    }

    async fn run_monitor_loop(self: Arc<Self>) {
        let monitor = PositionMonitor::new(
            self.registry.clone(),
            self.history.clone(),
            self.density.clone(),
            self.execution.clone(),
            self.config.strategy.velocity_slowdown_threshold,
            self.config.strategy.imbalance_change_threshold,
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(MONITOR_LOOP_INTERVAL_SECS));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut books = HashMap::new();
                    for position in self.registry.open_positions() {
                        if let Some(book) = self.market_feed.current_book(&position.symbol).await {
                            books.insert(position.symbol.clone(), book);
                        }
                    }
                    let params = self.coin_params.read().clone();
                    monitor.tick(&books, &params).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_safety_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.safety.check_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let state = self.safety.tick(self.client.as_ref()).await;
                    if state == SafetyState::Emergency {
                        self.safety.force_close_all().await;
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Refreshes the active-symbol set on the market cadence and the cached
    /// 24h change on the (longer) trend cadence. A symbol with an open
    /// position is never unsubscribed or deactivated even if it drops out of
    /// the externally supplied active set; it is simply excluded from new
    /// subscriptions on the next refresh once it has no open position.
    async fn run_market_data_loop(self: Arc<Self>) {
        let mut market_interval = tokio::time::interval(self.config.market.update_interval);
        let mut trend_interval = tokio::time::interval(self.config.strategy.trend_refresh_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = market_interval.tick() => self.refresh_active_symbols().await,
                _ = trend_interval.tick() => self.refresh_trend_inputs().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn refresh_active_symbols(&self) {
        let fetched = match self.market_data.fetch_active_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not refresh active symbol set");
                return;
            }
        };
        let held: Vec<String> = self.registry.open_positions().into_iter().map(|p| p.symbol).collect();

        let mut next = fetched.clone();
        for symbol in &held {
            if !next.contains(symbol) {
                next.push(symbol.clone());
            }
        }

        let previous = self.active_symbols.read().clone();
        for symbol in &next {
            if !previous.contains(symbol) {
                self.market_feed.subscribe(symbol).await;
                if !self.coin_params.read().contains_key(symbol) {
                    let defaults = default_coin_parameters(symbol);
                    if let Err(e) = self.registry.upsert_coin_parameters(&defaults).await {
                        warn!(symbol = %symbol, error = %e, "failed to persist default coin parameters");
                    }
                    self.coin_params.write().insert(symbol.clone(), defaults);
                }
            }
        }
        for symbol in &previous {
            if !next.contains(symbol) {
                self.market_feed.unsubscribe(symbol).await;
            }
        }

        *self.active_symbols.write() = next;
    }

    async fn refresh_trend_inputs(&self) {
        let symbols = self.active_symbols.read().clone();
        for symbol in symbols {
            match self.market_data.fetch_24h_change(&symbol).await {
                Ok(change) => self.trend.record_24h_change(&symbol, change),
                Err(e) => warn!(symbol = %symbol, error = %e, "could not refresh 24h change"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_is_one_cent() {
        assert_eq!(DEFAULT_TICK, rust_decimal_macros::dec!(0.01));
    }
}
