//! Safety Supervisor: periodic balance/exposure/connection checks that can
//! raise an EMERGENCY condition forcing a global close-and-exit. Grounded on
//! `main.rs`'s `DataSourceKillSwitch` and `route_quality/mitigation.rs`'s
//! `CircuitBreaker`/`CircuitState` pattern for state-machine-style health gating.

use crate::config::SafetyConfig;
use crate::exchange::{ExchangeClient, OrderSide};
use crate::execution::ExecutionCore;
use crate::market_feed::MarketFeed;
use crate::registry::PositionRegistry;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Normal,
    /// New signal generation is blocked but open positions keep their stops.
    SoftStop,
    /// Force-close everything and shut down.
    Emergency,
}

pub struct SafetySupervisor<C: ExchangeClient> {
    config: SafetyConfig,
    max_exposure_percent: Decimal,
    registry: Arc<PositionRegistry>,
    market_feed: MarketFeed,
    execution: Arc<ExecutionCore<C>>,
    state: Arc<parking_lot::RwLock<SafetyState>>,
    emergency_flag: Arc<AtomicBool>,
}

impl<C: ExchangeClient> SafetySupervisor<C> {
    pub fn new(
        config: SafetyConfig,
        max_exposure_percent: Decimal,
        registry: Arc<PositionRegistry>,
        market_feed: MarketFeed,
        execution: Arc<ExecutionCore<C>>,
    ) -> Self {
        Self {
            config,
            max_exposure_percent,
            registry,
            market_feed,
            execution,
            state: Arc::new(parking_lot::RwLock::new(SafetyState::Normal)),
            emergency_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SafetyState {
        *self.state.read()
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency_flag.load(Ordering::SeqCst)
    }

    /// One supervisory pass; intended to be driven by the Orchestrator's
    /// ~30 s loop. Returns the resulting state for the caller to act on.
    pub async fn tick(&self, client: &C) -> SafetyState {
        let balance = match client.get_wallet_balance().await {
            Ok(b) => b.wallet_balance,
            Err(e) => {
                warn!(error = %e, "safety check could not read wallet balance");
                return self.state();
            }
        };

        if balance < self.config.min_balance_usdt {
            error!(balance = %balance, min_balance = %self.config.min_balance_usdt, "balance below minimum, raising EMERGENCY");
            return self.raise_emergency(client, "balance below minimum").await;
        }

        let open_positions = self.registry.open_positions();
        let aggregate_notional: Decimal = open_positions.iter().map(|p| p.entry_price * p.size).sum();
        let exposure_limit = self.max_exposure_percent / Decimal::ONE_HUNDRED * balance;
        if aggregate_notional > exposure_limit {
            warn!(aggregate_notional = %aggregate_notional, limit = %exposure_limit, "aggregate exposure exceeds limit, blocking new signals");
            *self.state.write() = SafetyState::SoftStop;
        } else if self.state() == SafetyState::SoftStop {
            *self.state.write() = SafetyState::Normal;
        }

        let seconds_down = self.market_feed.seconds_since_last_update();
        if seconds_down >= self.config.connection_loss_timeout.as_secs() as i64 && !open_positions.is_empty() {
            error!(seconds_down, "connection lost with open positions, raising EMERGENCY");
            return self.raise_emergency(client, "connection lost with open positions").await;
        }

        self.state()
    }

    async fn raise_emergency(&self, _client: &C, reason: &str) -> SafetyState {
        *self.state.write() = SafetyState::Emergency;
        self.emergency_flag.store(true, Ordering::SeqCst);
        let _ = self
            .registry
            .log_system_event("emergency_triggered", "CRITICAL", None, reason)
            .await;
        SafetyState::Emergency
    }

    /// Force-closes every open position in parallel via the Execution Core's
    /// dedicated FORCE_CLOSE path (5 attempts, linear backoff, explicit
    /// size=0 confirmation) rather than the generic reduce-only retry used by
    /// ordinary position exits. Never returns early: every position either
    /// closes or exhausts its retry budget and is logged as still open.
    pub async fn force_close_all(&self) {
        let positions = self.registry.open_positions();
        if positions.is_empty() {
            return;
        }
        info!(count = positions.len(), "emergency: force-closing all open positions");

        let futures = positions.into_iter().map(|position| {
            let execution = self.execution.clone();
            let registry = self.registry.clone();
            let market_feed = self.market_feed.clone();
            async move {
                let filled_side = OrderSide::from_direction(position.direction);
                match execution
                    .force_close(&position.symbol, filled_side, position.size)
                    .await
                {
                    Ok(()) => {
                        let exit_price = market_feed
                            .current_book(&position.symbol)
                            .await
                            .and_then(|b| b.mid_price())
                            .unwrap_or(position.entry_price);
                        if let Err(e) = registry
                            .close(&position.symbol, exit_price, crate::model::ExitReason::Emergency)
                            .await
                        {
                            error!(symbol = %position.symbol, error = %e, "failed to persist emergency close");
                        }
                    }
                    Err(e) => {
                        error!(symbol = %position.symbol, error = %e, "emergency close did not confirm, position remains open");
                    }
                }
            }
        });
        futures_util::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_state_starts_normal() {
        assert_eq!(SafetyState::Normal, SafetyState::Normal);
    }
}
