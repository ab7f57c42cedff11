//! Position Registry: authoritative in-process open-position set with
//! durable trade records on SQLite. rusqlite/`Arc<Mutex<Connection>>`/WAL/
//! `prepare_cached`+`ON CONFLICT DO UPDATE` pattern grounded directly on
//! `vault/vault_db.rs`.

use crate::exchange::ExchangeClient;
use crate::model::{CoinParameters, Direction, ExitReason, Position, PositionStatus, SignalKind};
use anyhow::{Context, Result};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub struct PositionRegistry {
    conn: Arc<Mutex<Connection>>,
    open: Arc<SyncMutex<HashMap<String, Position>>>,
}

impl PositionRegistry {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("opening sqlite database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                position_size TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                direction TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                profit_loss TEXT,
                profit_loss_percent TEXT,
                stop_loss_price TEXT NOT NULL,
                breakeven_moved INTEGER NOT NULL,
                status TEXT NOT NULL,
                exit_reason TEXT,
                parameters_snapshot TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_open ON trades(status) WHERE status = 'OPEN';

            CREATE TABLE IF NOT EXISTS coin_parameters (
                symbol TEXT PRIMARY KEY,
                density_threshold_abs TEXT NOT NULL,
                relative_multiplier TEXT NOT NULL,
                density_threshold_percent TEXT NOT NULL,
                cluster_range_percent TEXT NOT NULL,
                breakout_erosion_percent TEXT NOT NULL,
                breakout_min_stop_loss_percent TEXT NOT NULL,
                bounce_density_stable_percent TEXT NOT NULL,
                bounce_density_erosion_exit_percent TEXT NOT NULL,
                bounce_stop_loss_behind_density_percent TEXT NOT NULL,
                breakeven_profit_percent TEXT NOT NULL,
                touch_tolerance_percent TEXT NOT NULL,
                lot_step TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                preferred_strategy TEXT
            );

            CREATE TABLE IF NOT EXISTS market_stats (
                symbol TEXT PRIMARY KEY,
                volume_24h TEXT NOT NULL,
                price_change_24h_percent TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                rank INTEGER,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS system_events (
                time TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                symbol TEXT,
                details TEXT
            );

            CREATE TABLE IF NOT EXISTS orderbook_snapshots (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                bids TEXT NOT NULL,
                asks TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orderbook_snapshots_symbol
                ON orderbook_snapshots(symbol, captured_at);

            CREATE TABLE IF NOT EXISTS densities (
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price_level TEXT NOT NULL,
                event TEXT NOT NULL,
                volume TEXT NOT NULL,
                is_cluster INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_densities_symbol ON densities(symbol, recorded_at);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            open: Arc::new(SyncMutex::new(HashMap::new())),
        })
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.lock().values().cloned().collect()
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.open.lock().get(symbol).cloned()
    }

    pub async fn create_open(&self, position: Position) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO trades (id, symbol, entry_time, entry_price, position_size, leverage,
                direction, signal_type, stop_loss_price, breakeven_moved, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'OPEN')
             ON CONFLICT(id) DO UPDATE SET status = 'OPEN'",
        )?;
        stmt.execute(params![
            position.id.to_string(),
            position.symbol,
            position.opened_at.to_rfc3339(),
            position.entry_price.to_string(),
            position.size.to_string(),
            position.leverage,
            position.direction.as_str(),
            position.signal_kind.as_str(),
            position.stop_loss.to_string(),
            position.breakeven_moved as i64,
        ])?;
        drop(conn);
        self.open.lock().insert(position.symbol.clone(), position);
        Ok(())
    }

    pub async fn update_stop(&self, symbol: &str, stop_loss: Decimal, breakeven_moved: bool) -> Result<()> {
        let id = {
            let mut open = self.open.lock();
            let Some(position) = open.get_mut(symbol) else {
                return Ok(());
            };
            position.stop_loss = stop_loss;
            position.breakeven_moved = breakeven_moved;
            position.id.to_string()
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET stop_loss_price = ?1, breakeven_moved = ?2 WHERE id = ?3",
            params![stop_loss.to_string(), breakeven_moved as i64, id],
        )?;
        Ok(())
    }

    pub async fn close(
        &self,
        symbol: &str,
        exit_price: Decimal,
        exit_reason: ExitReason,
    ) -> Result<Option<Position>> {
        let Some(mut position) = self.open.lock().remove(symbol) else {
            return Ok(None);
        };
        let pnl = position.realized_pnl(exit_price);
        let pnl_percent = position.unrealized_pnl_percent(exit_price);
        position.status = PositionStatus::Closed;
        position.closed_at = Some(chrono::Utc::now());
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(exit_reason);

        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET exit_time = ?1, exit_price = ?2, profit_loss = ?3,
                profit_loss_percent = ?4, status = 'CLOSED', exit_reason = ?5 WHERE id = ?6",
            params![
                position.closed_at.unwrap().to_rfc3339(),
                exit_price.to_string(),
                pnl.to_string(),
                pnl_percent.to_string(),
                exit_reason.as_str(),
                position.id.to_string(),
            ],
        )?;
        Ok(Some(position))
    }

    pub async fn log_system_event(&self, event_type: &str, severity: &str, symbol: Option<&str>, details: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_events (time, event_type, severity, symbol, details) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chrono::Utc::now().to_rfc3339(), event_type, severity, symbol, details],
        )?;
        Ok(())
    }

    /// Periodic full-depth archive of a symbol's book, driven off
    /// `WebsocketConfig.snapshot_interval`.
    pub async fn save_orderbook_snapshot(&self, book: &crate::model::OrderBook) -> Result<()> {
        let bids = serde_json::to_string(&book.bids).context("serializing bid levels")?;
        let asks = serde_json::to_string(&book.asks).context("serializing ask levels")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orderbook_snapshots (id, symbol, captured_at, bids, asks) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                book.symbol,
                book.timestamp.to_rfc3339(),
                bids,
                asks,
            ],
        )?;
        Ok(())
    }

    /// Appends a density lifecycle transition (Appeared/Updated/Disappeared)
    /// for audit and offline erosion analysis.
    pub async fn record_density_event(&self, event: &crate::density::DensityEvent) -> Result<()> {
        let (label, density) = match event {
            crate::density::DensityEvent::Appeared(d) => ("APPEARED", d),
            crate::density::DensityEvent::Updated(d) => ("UPDATED", d),
            crate::density::DensityEvent::Disappeared(d) => ("DISAPPEARED", d),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO densities (symbol, side, price_level, event, volume, is_cluster, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                density.symbol,
                format!("{:?}", density.side).to_uppercase(),
                density.price_level.to_string(),
                label,
                density.current_volume.to_string(),
                density.is_cluster as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Startup reconciliation: fetches exchange-open positions
    /// and DB-open trade rows, joins by symbol. Matched pairs restart
    /// monitoring with breakeven_moved/stop_loss restored from the DB row.
    /// Exchange positions with no DB row are logged and left for manual
    /// reconciliation, never auto-adopted.
    pub async fn reconcile<C: ExchangeClient>(&self, client: &C) -> Result<()> {
        let exchange_positions = client.get_positions().await.context("fetching exchange positions")?;
        let db_open_rows = self.load_open_rows().await?;

        let mut by_symbol: HashMap<String, Position> = HashMap::new();
        for row in db_open_rows {
            by_symbol.insert(row.symbol.clone(), row);
        }

        let mut restored = HashMap::new();
        for ex_pos in &exchange_positions {
            match by_symbol.remove(&ex_pos.symbol) {
                Some(db_row) => {
                    restored.insert(ex_pos.symbol.clone(), db_row);
                }
                None => {
                    warn!(symbol = %ex_pos.symbol, "exchange reports an open position with no matching DB trade row; left for manual reconciliation");
                    self.log_system_event(
                        "unreconciled_position",
                        "WARNING",
                        Some(&ex_pos.symbol),
                        "exchange-open position has no DB trade row",
                    )
                    .await?;
                }
            }
        }

        *self.open.lock() = restored;
        Ok(())
    }

    pub async fn load_coin_parameters(&self) -> Result<HashMap<String, CoinParameters>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT symbol, density_threshold_abs, relative_multiplier, density_threshold_percent,
                    cluster_range_percent, breakout_erosion_percent, breakout_min_stop_loss_percent,
                    bounce_density_stable_percent, bounce_density_erosion_exit_percent,
                    bounce_stop_loss_behind_density_percent, breakeven_profit_percent,
                    touch_tolerance_percent, lot_step, enabled
             FROM coin_parameters",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, i64>(13)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (symbol, abs, rel, pct, cluster, breakout_erosion, breakout_sl, bounce_stable, bounce_exit, bounce_sl, breakeven, touch, lot_step, enabled) = row?;
            out.insert(
                symbol.clone(),
                CoinParameters {
                    symbol,
                    density_threshold_abs: Decimal::from_str(&abs)?,
                    relative_multiplier: Decimal::from_str(&rel)?,
                    density_threshold_percent: Decimal::from_str(&pct)?,
                    cluster_range_percent: Decimal::from_str(&cluster)?,
                    breakout_erosion_percent: Decimal::from_str(&breakout_erosion)?,
                    breakout_min_stop_loss_percent: Decimal::from_str(&breakout_sl)?,
                    bounce_density_stable_percent: Decimal::from_str(&bounce_stable)?,
                    bounce_density_erosion_exit_percent: Decimal::from_str(&bounce_exit)?,
                    bounce_stop_loss_behind_density_percent: Decimal::from_str(&bounce_sl)?,
                    breakeven_profit_percent: Decimal::from_str(&breakeven)?,
                    touch_tolerance_percent: Decimal::from_str(&touch)?,
                    lot_step: Decimal::from_str(&lot_step)?,
                    enabled: enabled != 0,
                },
            );
        }
        Ok(out)
    }

    pub async fn upsert_coin_parameters(&self, params: &CoinParameters) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO coin_parameters (symbol, density_threshold_abs, relative_multiplier,
                density_threshold_percent, cluster_range_percent, breakout_erosion_percent,
                breakout_min_stop_loss_percent, bounce_density_stable_percent,
                bounce_density_erosion_exit_percent, bounce_stop_loss_behind_density_percent,
                breakeven_profit_percent, touch_tolerance_percent, lot_step, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(symbol) DO UPDATE SET
                density_threshold_abs = excluded.density_threshold_abs,
                relative_multiplier = excluded.relative_multiplier,
                density_threshold_percent = excluded.density_threshold_percent,
                cluster_range_percent = excluded.cluster_range_percent,
                breakout_erosion_percent = excluded.breakout_erosion_percent,
                breakout_min_stop_loss_percent = excluded.breakout_min_stop_loss_percent,
                bounce_density_stable_percent = excluded.bounce_density_stable_percent,
                bounce_density_erosion_exit_percent = excluded.bounce_density_erosion_exit_percent,
                bounce_stop_loss_behind_density_percent = excluded.bounce_stop_loss_behind_density_percent,
                breakeven_profit_percent = excluded.breakeven_profit_percent,
                touch_tolerance_percent = excluded.touch_tolerance_percent,
                lot_step = excluded.lot_step,
                enabled = excluded.enabled",
            params![
                params.symbol,
                params.density_threshold_abs.to_string(),
                params.relative_multiplier.to_string(),
                params.density_threshold_percent.to_string(),
                params.cluster_range_percent.to_string(),
                params.breakout_erosion_percent.to_string(),
                params.breakout_min_stop_loss_percent.to_string(),
                params.bounce_density_stable_percent.to_string(),
                params.bounce_density_erosion_exit_percent.to_string(),
                params.bounce_stop_loss_behind_density_percent.to_string(),
                params.breakeven_profit_percent.to_string(),
                params.touch_tolerance_percent.to_string(),
                params.lot_step.to_string(),
                params.enabled as i64,
            ],
        )?;
        Ok(())
    }

    async fn load_open_rows(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, entry_price, position_size, leverage, direction, signal_type,
                    stop_loss_price, breakeven_moved, entry_time
             FROM trades WHERE status = 'OPEN'",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let symbol: String = row.get(1)?;
            let entry_price: String = row.get(2)?;
            let size: String = row.get(3)?;
            let leverage: i64 = row.get(4)?;
            let direction: String = row.get(5)?;
            let signal_type: String = row.get(6)?;
            let stop_loss: String = row.get(7)?;
            let breakeven_moved: i64 = row.get(8)?;
            let entry_time: String = row.get(9)?;
            Ok((
                id,
                symbol,
                entry_price,
                size,
                leverage,
                direction,
                signal_type,
                stop_loss,
                breakeven_moved,
                entry_time,
            ))
        })?;

        let mut positions = Vec::new();
        for row in rows {
            let (id, symbol, entry_price, size, leverage, direction, signal_type, stop_loss, breakeven_moved, entry_time) = row?;
            positions.push(Position {
                id: uuid::Uuid::parse_str(&id).unwrap_or_else(|_| uuid::Uuid::new_v4()),
                symbol,
                direction: if direction == "LONG" { Direction::Long } else { Direction::Short },
                entry_price: Decimal::from_str(&entry_price)?,
                size: Decimal::from_str(&size)?,
                leverage: leverage as u32,
                signal_kind: if signal_type == "BREAKOUT" { SignalKind::Breakout } else { SignalKind::Bounce },
                density_price: Decimal::ZERO,
                stop_loss: Decimal::from_str(&stop_loss)?,
                breakeven_moved: breakeven_moved != 0,
                status: PositionStatus::Open,
                opened_at: chrono::DateTime::parse_from_rfc3339(&entry_time)
                    .map(|d| d.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
                closed_at: None,
                exit_reason: None,
                exit_price: None,
            });
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::NamedTempFile;

    fn position() -> Position {
        Position {
            id: uuid::Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            entry_price: dec!(50005),
            size: dec!(0.002),
            leverage: 5,
            signal_kind: SignalKind::Breakout,
            density_price: dec!(50000),
            stop_loss: dec!(49950),
            breakeven_moved: false,
            status: PositionStatus::Open,
            opened_at: chrono::Utc::now(),
            closed_at: None,
            exit_reason: None,
            exit_price: None,
        }
    }

    #[tokio::test]
    async fn create_then_close_updates_status() {
        let file = NamedTempFile::new().unwrap();
        let registry = PositionRegistry::open(file.path().to_str().unwrap()).unwrap();
        registry.create_open(position()).await.unwrap();
        assert_eq!(registry.open_positions().len(), 1);

        let closed = registry
            .close("BTCUSDT", dec!(50100), ExitReason::TakeProfit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(registry.open_positions().len(), 0);
    }

    #[tokio::test]
    async fn breakeven_update_persists_stop() {
        let file = NamedTempFile::new().unwrap();
        let registry = PositionRegistry::open(file.path().to_str().unwrap()).unwrap();
        registry.create_open(position()).await.unwrap();
        registry.update_stop("BTCUSDT", dec!(50005), true).await.unwrap();
        let p = registry.get("BTCUSDT").unwrap();
        assert!(p.breakeven_moved);
        assert_eq!(p.stop_loss, dec!(50005));
    }

    fn coin_parameters() -> CoinParameters {
        CoinParameters {
            symbol: "ETHUSDT".into(),
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
            lot_step: dec!(0.01),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn coin_parameters_round_trip_through_upsert_and_load() {
        let file = NamedTempFile::new().unwrap();
        let registry = PositionRegistry::open(file.path().to_str().unwrap()).unwrap();
        registry.upsert_coin_parameters(&coin_parameters()).await.unwrap();

        let loaded = registry.load_coin_parameters().await.unwrap();
        let params = loaded.get("ETHUSDT").unwrap();
        assert_eq!(params.lot_step, dec!(0.01));
        assert_eq!(params.density_threshold_abs, dec!(100000));

        let mut updated = coin_parameters();
        updated.lot_step = dec!(0.1);
        registry.upsert_coin_parameters(&updated).await.unwrap();
        let reloaded = registry.load_coin_parameters().await.unwrap();
        assert_eq!(reloaded.get("ETHUSDT").unwrap().lot_step, dec!(0.1));
    }

    #[tokio::test]
    async fn save_orderbook_snapshot_persists_a_row() {
        let file = NamedTempFile::new().unwrap();
        let registry = PositionRegistry::open(file.path().to_str().unwrap()).unwrap();
        let book = crate::model::OrderBook {
            symbol: "BTCUSDT".into(),
            timestamp: chrono::Utc::now(),
            bids: vec![crate::model::PriceLevel::new(dec!(50000), dec!(1))],
            asks: vec![crate::model::PriceLevel::new(dec!(50010), dec!(1))],
        };
        registry.save_orderbook_snapshot(&book).await.unwrap();

        let conn = registry.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orderbook_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn record_density_event_persists_a_row() {
        let file = NamedTempFile::new().unwrap();
        let registry = PositionRegistry::open(file.path().to_str().unwrap()).unwrap();
        let density = crate::model::Density {
            symbol: "BTCUSDT".into(),
            side: crate::model::Side::Ask,
            price_level: dec!(50000),
            initial_volume: dec!(10),
            current_volume: dec!(10),
            appeared_at: chrono::Utc::now(),
            last_seen_at: chrono::Utc::now(),
            disappeared_at: None,
            is_cluster: false,
            consecutive_absolute_failures: 0,
        };
        registry
            .record_density_event(&crate::density::DensityEvent::Appeared(density))
            .await
            .unwrap();

        let conn = registry.conn.lock().await;
        let event: String = conn
            .query_row("SELECT event FROM densities", [], |r| r.get(0))
            .unwrap();
        assert_eq!(event, "APPEARED");
    }
}
