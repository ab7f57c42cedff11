//! Execution Core: IDLE→SET_ISOLATED→SET_LEVERAGE→PLACE_MARKET→SET_STOP→CONFIRMED,
//! with the FORCE_CLOSE compensating path on stop failure. Generalizes
//! `vault/execution.rs`'s `ExecutionAdapter`/retry plumbing from Polymarket
//! CLOB semantics to Bybit-style unified-trading semantics.

use crate::exchange::{ExchangeClient, OrderSide, PlaceOrderRequest, RateGate};
use crate::model::{Direction, Position, PositionStatus, Signal, SignalKind};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const NON_CRITICAL_ATTEMPTS: u32 = 3;
const CRITICAL_ATTEMPTS: u32 = 5;
const NON_CRITICAL_BACKOFF_BASE: Duration = Duration::from_secs(1);
const FORCE_CLOSE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum ExecutionOutcome {
    Confirmed(Position),
    ForceClosed {
        symbol: String,
        direction: Direction,
        size: Decimal,
    },
}

pub struct ExecutionCore<C: ExchangeClient> {
    client: Arc<C>,
    gate: RateGate,
}

impl<C: ExchangeClient> ExecutionCore<C> {
    pub fn new(client: Arc<C>, gate: RateGate) -> Self {
        Self { client, gate }
    }

    pub async fn execute(
        &self,
        signal: &Signal,
        leverage: u32,
        position_size_usdt: Decimal,
        lot_step: Decimal,
    ) -> Result<ExecutionOutcome> {
        self.set_isolated_and_leverage(&signal.symbol, leverage).await?;

        let raw_qty = position_size_usdt * Decimal::from(leverage) / signal.entry_price;
        let qty = floor_to_lot_step(raw_qty, lot_step);
        let side = OrderSide::from_direction(signal.direction);

        let fill = self
            .place_with_retry(&signal.symbol, side, qty, false, NON_CRITICAL_ATTEMPTS)
            .await
            .context("PLACE_MARKET failed")?;

        match self.set_stop_with_retry(&signal.symbol, signal.stop_loss).await {
            Ok(()) => {
                let position = Position {
                    id: signal.id,
                    symbol: signal.symbol.clone(),
                    direction: signal.direction,
                    entry_price: fill.avg_price,
                    size: fill.cum_exec_qty,
                    leverage,
                    signal_kind: signal.kind,
                    density_price: signal.density_price,
                    stop_loss: signal.stop_loss,
                    breakeven_moved: false,
                    status: PositionStatus::Open,
                    opened_at: chrono::Utc::now(),
                    closed_at: None,
                    exit_reason: None,
                    exit_price: None,
                };
                Ok(ExecutionOutcome::Confirmed(position))
            }
            Err(e) => {
                error!(symbol = %signal.symbol, error = %e, "SET_STOP failed after retries, forcing close");
                self.force_close(&signal.symbol, side, fill.cum_exec_qty).await?;
                Ok(ExecutionOutcome::ForceClosed {
                    symbol: signal.symbol.clone(),
                    direction: signal.direction,
                    size: fill.cum_exec_qty,
                })
            }
        }
    }

    /// Reduce-only market close for an already-open position, used by the
    /// Position Monitor's exit evaluator. Treated as a critical call.
    pub async fn close_position(&self, symbol: &str, direction: Direction, size: Decimal) -> Result<Decimal> {
        let side = OrderSide::from_direction(direction).opposite();
        let ack = self
            .place_with_retry(symbol, side, size, true, CRITICAL_ATTEMPTS)
            .await
            .context("reduce-only close failed")?;
        Ok(ack.avg_price)
    }

    pub async fn set_trading_stop(&self, symbol: &str, stop_loss: Decimal) -> Result<()> {
        self.set_stop_with_retry(symbol, stop_loss).await
    }

    async fn set_isolated_and_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let _permit = self.gate.acquire().await;
        // Idempotent: "already configured" is folded into RetCode::is_success
        // by the client, so a retry here is just the normal non-critical path.
        retry(NON_CRITICAL_ATTEMPTS, NON_CRITICAL_BACKOFF_BASE, || {
            self.client.switch_margin_mode_isolated(symbol, leverage)
        })
        .await?;
        retry(NON_CRITICAL_ATTEMPTS, NON_CRITICAL_BACKOFF_BASE, || {
            self.client.set_leverage(symbol, leverage)
        })
        .await
    }

    async fn place_with_retry(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
        attempts: u32,
    ) -> Result<crate::exchange::OrderAck> {
        let _permit = self.gate.acquire().await;
        retry(attempts, NON_CRITICAL_BACKOFF_BASE, || {
            self.client.place_order(PlaceOrderRequest {
                symbol: symbol.to_string(),
                side,
                qty,
                reduce_only,
            })
        })
        .await
    }

    async fn set_stop_with_retry(&self, symbol: &str, stop_loss: Decimal) -> Result<()> {
        let _permit = self.gate.acquire().await;
        retry(CRITICAL_ATTEMPTS, NON_CRITICAL_BACKOFF_BASE, || {
            self.client.set_trading_stop(symbol, stop_loss)
        })
        .await
    }

    /// Retries a reduce-only opposite-side market order with elevated
    /// urgency (linear, not exponential, backoff) until size reported as
    /// zero. Never returns without confirming size=0 or exhausting the call
    /// budget. This is also the path the Safety Supervisor calls directly on
    /// EMERGENCY, rather than the generic `close_position` used for ordinary
    /// exits.
    pub async fn force_close(&self, symbol: &str, filled_side: OrderSide, size: Decimal) -> Result<()> {
        let close_side = filled_side.opposite();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let _permit = self.gate.acquire().await;
            match self
                .client
                .place_order(PlaceOrderRequest {
                    symbol: symbol.to_string(),
                    side: close_side,
                    qty: size,
                    reduce_only: true,
                })
                .await
            {
                Ok(ack) if ack.cum_exec_qty >= size => {
                    info!(symbol, attempt, "force-close confirmed size=0");
                    return Ok(());
                }
                Ok(_) => warn!(symbol, attempt, "force-close partial fill, retrying"),
                Err(e) => warn!(symbol, attempt, error = %e, "force-close attempt failed"),
            }
            if attempt >= CRITICAL_ATTEMPTS {
                return Err(anyhow::anyhow!(
                    "force-close on {symbol} did not confirm size=0 after {attempt} attempts"
                ));
            }
            tokio::time::sleep(FORCE_CLOSE_BACKOFF).await;
        }
    }
}

/// Rounds `qty` down to the nearest multiple of `lot_step`. A zero step
/// means the symbol imposes no increment and `qty` passes through unrounded.
fn floor_to_lot_step(qty: Decimal, lot_step: Decimal) -> Decimal {
    if lot_step.is_zero() {
        return qty;
    }
    (qty / lot_step).floor() * lot_step
}

async fn retry<T, F, Fut>(attempts: u32, base_backoff: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if let Some(crate::error::EngineError::RateLimited { retry_after_ms }) =
                    e.downcast_ref::<crate::error::EngineError>()
                {
                    tokio::time::sleep(Duration::from_millis(*retry_after_ms)).await;
                } else {
                    tokio::time::sleep(base_backoff * 2u32.pow(attempt)).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangePosition, OrderAck, WalletBalance};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStopClient {
        stop_failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl ExchangeClient for FlakyStopClient {
        async fn get_wallet_balance(&self) -> Result<WalletBalance> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
            unimplemented!()
        }
        async fn place_order(&self, req: PlaceOrderRequest) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: "1".into(),
                avg_price: rust_decimal_macros::dec!(50005),
                cum_exec_qty: req.qty,
            })
        }
        async fn set_trading_stop(&self, _symbol: &str, _stop_loss: Decimal) -> Result<()> {
            if self.stop_failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(anyhow::anyhow!("simulated rejection"))
            } else {
                Ok(())
            }
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
            Ok(())
        }
        async fn switch_margin_mode_isolated(&self, _symbol: &str, _leverage: u32) -> Result<()> {
            Ok(())
        }
    }

    fn signal() -> Signal {
        Signal {
            id: uuid::Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            kind: SignalKind::Breakout,
            direction: Direction::Long,
            entry_price: rust_decimal_macros::dec!(50005),
            stop_loss: rust_decimal_macros::dec!(49950),
            density_price: rust_decimal_macros::dec!(50000),
            density_side: crate::model::Side::Ask,
            priority: 1,
            created_at: chrono::Utc::now(),
            consumed: false,
        }
    }

    #[tokio::test]
    async fn stop_failure_forces_close_never_registers_position() {
        let client = Arc::new(FlakyStopClient {
            stop_failures_remaining: AtomicU32::new(CRITICAL_ATTEMPTS),
        });
        let core = ExecutionCore::new(client, RateGate::new(20));
        let outcome = core
            .execute(&signal(), 5, rust_decimal_macros::dec!(100), rust_decimal_macros::dec!(0.001))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::ForceClosed { symbol, .. } => assert_eq!(symbol, "BTCUSDT"),
            ExecutionOutcome::Confirmed(_) => panic!("must not confirm when stop never sets"),
        }
    }

    #[tokio::test]
    async fn stop_success_confirms_position() {
        let client = Arc::new(FlakyStopClient {
            stop_failures_remaining: AtomicU32::new(0),
        });
        let core = ExecutionCore::new(client, RateGate::new(20));
        let outcome = core
            .execute(&signal(), 5, rust_decimal_macros::dec!(100), rust_decimal_macros::dec!(0.001))
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Confirmed(_)));
    }

    #[test]
    fn floor_to_lot_step_rounds_down_to_increment() {
        assert_eq!(
            floor_to_lot_step(rust_decimal_macros::dec!(0.01999), rust_decimal_macros::dec!(0.001)),
            rust_decimal_macros::dec!(0.019)
        );
        assert_eq!(
            floor_to_lot_step(rust_decimal_macros::dec!(1.2345), rust_decimal_macros::dec!(0.01)),
            rust_decimal_macros::dec!(1.23)
        );
    }

    #[test]
    fn floor_to_lot_step_passes_through_on_zero_step() {
        assert_eq!(
            floor_to_lot_step(rust_decimal_macros::dec!(1.2345), Decimal::ZERO),
            rust_decimal_macros::dec!(1.2345)
        );
    }
}
