//! Exchange websocket transport: one logical stream carrying per-symbol
//! orderbook snapshot + delta frames, with sequence validation and
//! exponential-backoff reconnect. Subscribe-on-demand over an mpsc
//! command channel, `tokio::select!` over ping/command/read, and the
//! doubling 1s-to-30s reconnect delay.

use crate::config::WebsocketConfig;
use crate::model::{OrderBook, PriceLevel, Side};
use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";

pub enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Default)]
struct SymbolState {
    book: ArcSwap<Option<OrderBook>>,
    last_update_id: AtomicU64,
}

/// Shared, lock-cheap cache of the latest book per symbol, plus the gap
/// counter the Market Feed watches to decide when to force a resnapshot.
#[derive(Clone)]
pub struct BookCache {
    symbols: Arc<RwLock<HashMap<String, Arc<SymbolState>>>>,
    gap_count: Arc<AtomicU64>,
}

impl BookCache {
    pub fn new() -> Self {
        Self {
            symbols: Arc::new(RwLock::new(HashMap::new())),
            gap_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<OrderBook> {
        let map = self.symbols.read().await;
        map.get(symbol).and_then(|s| (**s.book.load()).clone())
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count.load(Ordering::Relaxed)
    }

    async fn entry(&self, symbol: &str) -> Arc<SymbolState> {
        {
            let map = self.symbols.read().await;
            if let Some(s) = map.get(symbol) {
                return s.clone();
            }
        }
        let mut map = self.symbols.write().await;
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(SymbolState::default()))
            .clone()
    }
}

#[derive(Deserialize)]
struct WsEnvelope {
    topic: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    data: Option<WsBookData>,
    #[serde(rename = "u")]
    update_id: Option<u64>,
}

#[derive(Deserialize)]
struct WsBookData {
    s: String,
    b: Vec<[String; 2]>,
    a: Vec<[String; 2]>,
}

fn parse_levels(raw: &[[String; 2]]) -> Vec<PriceLevel> {
    raw.iter()
        .filter_map(|[p, v]| {
            let price: Decimal = p.parse().ok()?;
            let volume: Decimal = v.parse().ok()?;
            Some(PriceLevel::new(price, volume))
        })
        .filter(|l| !l.volume.is_zero())
        .collect()
}

fn sort_book(bids: &mut Vec<PriceLevel>, asks: &mut Vec<PriceLevel>) {
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    asks.sort_by(|a, b| a.price.cmp(&b.price));
}

/// Runs forever until `shutdown` fires, reconnecting with exponential backoff
/// on any error, exactly the way the Polymarket websocket client does.
pub async fn run(
    cache: BookCache,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    config: WebsocketConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut reconnect_delay = config.reconnect_delay_initial;
    let mut subscribed: Vec<String> = Vec::new();

    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect_and_stream(&cache, &mut cmd_rx, &subscribed, &mut shutdown).await {
            Ok(still_subscribed) => {
                subscribed = still_subscribed;
                reconnect_delay = config.reconnect_delay_initial;
            }
            Err(e) => {
                warn!(error = %e, "market feed websocket stream ended, reconnecting");
            }
        }
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.reconnect_delay_max);
    }
}

async fn connect_and_stream(
    cache: &BookCache,
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    already_subscribed: &[String],
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<Vec<String>> {
    let (ws_stream, _) = connect_async(STREAM_URL).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut subscribed = already_subscribed.to_vec();

    for symbol in &subscribed {
        send_subscribe(&mut write, symbol).await?;
    }

    let mut ping_interval = tokio::time::interval(std::time::Duration::from_secs(20));

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await.is_err() {
                    return Ok(subscribed);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    let _ = write.close().await;
                    return Ok(subscribed);
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Subscribe(symbol)) => {
                        send_subscribe(&mut write, &symbol).await?;
                        if !subscribed.contains(&symbol) {
                            subscribed.push(symbol);
                        }
                    }
                    Some(WsCommand::Unsubscribe(symbol)) => {
                        subscribed.retain(|s| s != &symbol);
                    }
                    None => return Ok(subscribed),
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(cache, &text),
                    Some(Ok(Message::Ping(p))) => { let _ = write.send(Message::Pong(p)).await; }
                    Some(Ok(Message::Close(_))) | None => return Ok(subscribed),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}

async fn send_subscribe(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    symbol: &str,
) -> anyhow::Result<()> {
    let topic = format!("orderbook.50.{symbol}");
    let msg = serde_json::json!({ "op": "subscribe", "args": [topic] }).to_string();
    write.send(Message::Text(msg)).await?;
    Ok(())
}

fn handle_text(cache: &BookCache, text: &str) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return, // pong / subscribe-ack frames are not book envelopes
    };
    let Some(topic) = envelope.topic else { return };
    if !topic.starts_with("orderbook.") {
        return;
    }
    let Some(data) = envelope.data else { return };
    let Some(update_id) = envelope.update_id else { return };
    let is_snapshot = envelope.msg_type.as_deref() == Some("snapshot");

    let cache = cache.clone();
    let symbol = data.s.clone();
    tokio::spawn(async move {
        let state = cache.entry(&symbol).await;
        let prior = state.last_update_id.load(Ordering::Acquire);
        if !is_snapshot && prior != 0 && update_id != prior + 1 {
            // Sequence gap: invalidate so the Market Feed resnapshots.
            cache.gap_count.fetch_add(1, Ordering::Relaxed);
            state.book.store(Arc::new(None));
            state.last_update_id.store(0, Ordering::Release);
            debug!(symbol, expected = prior + 1, got = update_id, "book sequence gap");
            return;
        }

        let mut bids = parse_levels(&data.b);
        let mut asks = parse_levels(&data.a);
        if is_snapshot {
            sort_book(&mut bids, &mut asks);
            let book = OrderBook {
                symbol: symbol.clone(),
                timestamp: Utc::now(),
                bids,
                asks,
            };
            state.book.store(Arc::new(Some(book)));
        } else {
            let current = (**state.book.load()).clone();
            let Some(mut book) = current else {
                // Delta arrived before any snapshot; drop until resnapshotted.
                return;
            };
            apply_delta(&mut book, bids, asks);
            book.timestamp = Utc::now();
            state.book.store(Arc::new(Some(book)));
        }
        state.last_update_id.store(update_id, Ordering::Release);
    });
}

fn apply_delta(book: &mut OrderBook, bid_updates: Vec<PriceLevel>, ask_updates: Vec<PriceLevel>) {
    apply_side(&mut book.bids, bid_updates, Side::Bid);
    apply_side(&mut book.asks, ask_updates, Side::Ask);
}

fn apply_side(levels: &mut Vec<PriceLevel>, updates: Vec<PriceLevel>, side: Side) {
    for update in updates {
        if let Some(pos) = levels.iter().position(|l| l.price == update.price) {
            if update.volume.is_zero() {
                levels.remove(pos);
            } else {
                levels[pos] = update;
            }
        } else if !update.volume.is_zero() {
            levels.push(update);
        }
    }
    match side {
        Side::Bid => levels.sort_by(|a, b| b.price.cmp(&a.price)),
        Side::Ask => levels.sort_by(|a, b| a.price.cmp(&b.price)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn apply_delta_removes_zero_volume_level() {
        let mut book = OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(100), dec!(1)), PriceLevel::new(dec!(99), dec!(2))],
            asks: vec![],
        };
        apply_delta(&mut book, vec![PriceLevel::new(dec!(100), dec!(0))], vec![]);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, dec!(99));
    }

    #[test]
    fn apply_delta_inserts_and_keeps_sort_order() {
        let mut book = OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![],
        };
        apply_delta(&mut book, vec![PriceLevel::new(dec!(101), dec!(1))], vec![]);
        assert_eq!(book.bids[0].price, dec!(101));
    }
}
