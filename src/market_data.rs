//! Default `MarketDataSource`: the external top-gainers/losers ranking and
//! 24h-change collaborator, backed by Bybit's public (unauthenticated)
//! tickers endpoint. Specified only at its interface per the engine's scope;
//! this is one concrete implementation of it.

use crate::orchestrator::MarketDataSource;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

pub struct BybitMarketDataSource {
    http: reqwest::Client,
    base_url: String,
    min_24h_volume: Decimal,
    top_gainers_count: usize,
    top_losers_count: usize,
}

impl BybitMarketDataSource {
    pub fn new(base_url: String, min_24h_volume: Decimal, top_gainers_count: usize, top_losers_count: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with static config"),
            base_url,
            min_24h_volume,
            top_gainers_count,
            top_losers_count,
        }
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>> {
        let url = format!("{}/v5/market/tickers?category=linear", self.base_url);
        let resp: Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/tickers failed")?
            .json()
            .await
            .context("tickers response was not valid JSON")?;
        let list = resp
            .get("result")
            .and_then(|r| r.get("list"))
            .cloned()
            .ok_or_else(|| anyhow!("tickers response missing result.list"))?;
        Ok(serde_json::from_value(list)?)
    }
}

#[derive(Deserialize)]
struct Ticker {
    symbol: String,
    #[serde(rename = "turnover24h")]
    turnover_24h: String,
    #[serde(rename = "price24hPcnt")]
    price_24h_pcnt: String,
}

#[async_trait]
impl MarketDataSource for BybitMarketDataSource {
    async fn fetch_active_symbols(&self) -> Result<Vec<String>> {
        let mut tickers = self.fetch_tickers().await?;
        tickers.retain(|t| {
            t.turnover_24h
                .parse::<Decimal>()
                .map(|v| v >= self.min_24h_volume)
                .unwrap_or(false)
        });
        tickers.sort_by(|a, b| {
            let pa: Decimal = a.price_24h_pcnt.parse().unwrap_or_default();
            let pb: Decimal = b.price_24h_pcnt.parse().unwrap_or_default();
            pb.cmp(&pa)
        });
        let gainers: Vec<String> = tickers.iter().take(self.top_gainers_count).map(|t| t.symbol.clone()).collect();
        let losers: Vec<String> = tickers
            .iter()
            .rev()
            .take(self.top_losers_count)
            .map(|t| t.symbol.clone())
            .collect();
        let mut combined = gainers;
        for symbol in losers {
            if !combined.contains(&symbol) {
                combined.push(symbol);
            }
        }
        Ok(combined)
    }

    async fn fetch_24h_change(&self, symbol: &str) -> Result<Decimal> {
        let tickers = self.fetch_tickers().await?;
        let ticker = tickers
            .into_iter()
            .find(|t| t.symbol == symbol)
            .ok_or_else(|| anyhow!("symbol {symbol} not present in tickers response"))?;
        let pct: Decimal = ticker.price_24h_pcnt.parse()?;
        Ok(pct * Decimal::ONE_HUNDRED)
    }
}
