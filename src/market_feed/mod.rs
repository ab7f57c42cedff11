//! Market Feed: one live book per active symbol, non-blocking reads, gap
//! detection, and the EMERGENCY assertion when the feed is down too long
//! with positions open. The cache-only, never-block-on-read contract is
//! grounded on `vault/book_access.rs`.

mod ws;

pub use ws::WsCommand;

use crate::config::WebsocketConfig;
use crate::model::OrderBook;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

#[derive(Clone)]
pub struct MarketFeed {
    cache: ws::BookCache,
    cmd_tx: mpsc::Sender<WsCommand>,
    shutdown_tx: watch::Sender<bool>,
    last_healthy_at_ms: Arc<AtomicI64>,
}

impl MarketFeed {
    /// Spawns the websocket task and returns a handle plus its join handle.
    pub fn spawn(config: WebsocketConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let cache = ws::BookCache::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_healthy_at_ms = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));

        let feed = Self {
            cache: cache.clone(),
            cmd_tx,
            shutdown_tx,
            last_healthy_at_ms: last_healthy_at_ms.clone(),
        };

        let handle = tokio::spawn(async move {
            ws::run(cache, cmd_rx, config, shutdown_rx).await;
        });

        (feed, handle)
    }

    pub async fn subscribe(&self, symbol: &str) {
        let _ = self.cmd_tx.send(WsCommand::Subscribe(symbol.to_string())).await;
    }

    pub async fn unsubscribe(&self, symbol: &str) {
        let _ = self
            .cmd_tx
            .send(WsCommand::Unsubscribe(symbol.to_string()))
            .await;
    }

    /// Never blocks on a writer: returns the latest consistent snapshot or
    /// `None` if the symbol has no book yet (never subscribed, or invalidated
    /// by a sequence gap awaiting resnapshot).
    pub async fn current_book(&self, symbol: &str) -> Option<OrderBook> {
        let book = self.cache.get(symbol).await;
        if book.is_some() {
            self.last_healthy_at_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
        book
    }

    /// Seconds since any symbol last produced a usable book. Used by the
    /// Safety Supervisor's connection-health check.
    pub fn seconds_since_last_update(&self) -> i64 {
        let last = self.last_healthy_at_ms.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        (now - last).max(0) / 1000
    }

    pub fn gap_count(&self) -> u64 {
        self.cache.gap_count()
    }

    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            warn!("market feed shutdown signaled after websocket task already gone");
        }
    }
}
