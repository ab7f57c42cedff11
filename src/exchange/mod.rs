//! Exchange HTTP abstraction (Bybit-style unified trading is the reference)
//! and the concurrency gate every exchange caller shares.

mod http;

pub use http::BybitClient;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_direction(direction: crate::model::Direction) -> Self {
        match direction {
            crate::model::Direction::Long => OrderSide::Buy,
            crate::model::Direction::Short => OrderSide::Sell,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub avg_price: Decimal,
    pub cum_exec_qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct WalletBalance {
    pub wallet_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub side: OrderSide,
}

/// Bybit's `retCode`: 0 is success, 10006 is rate-limited, everything else is an
/// error carrying `retMsg`. A handful of "already configured" codes count as
/// success for the idempotent set-ops (leverage, margin mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCode {
    Ok,
    RateLimited,
    AlreadyConfigured,
    Other(i64),
}

impl From<i64> for RetCode {
    fn from(code: i64) -> Self {
        match code {
            0 => RetCode::Ok,
            10006 => RetCode::RateLimited,
            // Bybit returns these for "leverage not modified" / "margin mode not modified".
            110043 | 110026 => RetCode::AlreadyConfigured,
            other => RetCode::Other(other),
        }
    }
}

impl RetCode {
    pub fn is_success(self) -> bool {
        matches!(self, RetCode::Ok | RetCode::AlreadyConfigured)
    }
}

/// The exchange HTTP surface the rest of the engine depends on. Abstracted so
/// that `BybitClient` and a deterministic test double can both satisfy it.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_wallet_balance(&self) -> Result<WalletBalance>;
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<OrderAck>;
    async fn set_trading_stop(&self, symbol: &str, stop_loss: Decimal) -> Result<()>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;
    async fn switch_margin_mode_isolated(&self, symbol: &str, leverage: u32) -> Result<()>;
}

/// Counting semaphore shared by every exchange caller, capping inflight REST calls.
#[derive(Clone)]
pub struct RateGate {
    inner: Arc<Semaphore>,
}

impl RateGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.inner
            .acquire()
            .await
            .expect("rate gate semaphore never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_code_classifies_known_bybit_codes() {
        assert!(RetCode::from(0).is_success());
        assert_eq!(RetCode::from(10006), RetCode::RateLimited);
        assert!(!RetCode::from(10006).is_success());
        assert!(RetCode::from(110043).is_success());
        assert!(!RetCode::from(30208).is_success());
    }
}
