//! Engine configuration, assembled from environment variables at startup.
//! Nested the way the market-data configs in `vault/unified_15m_strategy.rs`
//! and `vault/execution.rs` are: typed fields, `from_env()` constructors,
//! `.unwrap_or` fallbacks. No config-file parsing — out of scope.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

impl ExchangeConfig {
    pub fn from_env() -> Self {
        let testnet = env_or("EXCHANGE_TESTNET", true);
        Self {
            testnet,
            api_key: env::var("EXCHANGE_API_KEY").unwrap_or_default(),
            api_secret: env::var("EXCHANGE_API_SECRET").unwrap_or_default(),
            base_url: env::var("EXCHANGE_BASE_URL").unwrap_or_else(|_| {
                if testnet {
                    "https://api-testnet.bybit.com".to_string()
                } else {
                    "https://api.bybit.com".to_string()
                }
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub reconnect_delay_initial: Duration,
    pub reconnect_delay_max: Duration,
    pub orderbook_depth: usize,
    pub snapshot_interval: Duration,
}

impl WebsocketConfig {
    pub fn from_env() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_secs(env_or("WS_RECONNECT_DELAY_INITIAL_SECS", 1)),
            reconnect_delay_max: Duration::from_secs(env_or("WS_RECONNECT_DELAY_MAX_SECS", 30)),
            orderbook_depth: env_or("WS_ORDERBOOK_DEPTH", 50),
            snapshot_interval: Duration::from_secs(env_or("WS_SNAPSHOT_INTERVAL_SECS", 3600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub update_interval: Duration,
    pub top_gainers_count: usize,
    pub top_losers_count: usize,
    pub min_24h_volume: rust_decimal::Decimal,
}

impl MarketConfig {
    pub fn from_env() -> Self {
        Self {
            update_interval: Duration::from_secs(env_or("MARKET_UPDATE_INTERVAL_SECS", 10)),
            top_gainers_count: env_or("MARKET_TOP_GAINERS_COUNT", 10),
            top_losers_count: env_or("MARKET_TOP_LOSERS_COUNT", 10),
            min_24h_volume: env_or("MARKET_MIN_24H_VOLUME", "1000000".to_string())
                .parse()
                .unwrap_or(rust_decimal::Decimal::new(1_000_000, 0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub position_size_usdt: rust_decimal::Decimal,
    pub leverage: u32,
    pub max_concurrent_positions: usize,
    pub max_exposure_percent: rust_decimal::Decimal,
    pub max_per_position_percent: rust_decimal::Decimal,
}

impl TradingConfig {
    pub fn from_env() -> Self {
        Self {
            position_size_usdt: parse_decimal_env("TRADING_POSITION_SIZE_USDT", "100"),
            leverage: env_or("TRADING_LEVERAGE", 5),
            max_concurrent_positions: env_or("TRADING_MAX_CONCURRENT_POSITIONS", 5),
            max_exposure_percent: parse_decimal_env("TRADING_MAX_EXPOSURE_PERCENT", "50"),
            max_per_position_percent: parse_decimal_env("TRADING_MAX_PER_POSITION_PERCENT", "20"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub velocity_slowdown_threshold: rust_decimal::Decimal,
    pub imbalance_change_threshold: rust_decimal::Decimal,
    pub velocity_short_window_sec: i64,
    pub velocity_long_window_sec: i64,
    pub volume_history_window_sec: i64,
    pub trend_change_threshold_percent: rust_decimal::Decimal,
    pub trend_imbalance_ratio: rust_decimal::Decimal,
    pub trend_refresh_interval: Duration,
}

impl StrategyConfig {
    pub fn from_env() -> Self {
        Self {
            velocity_slowdown_threshold: parse_decimal_env("STRATEGY_VELOCITY_SLOWDOWN_THRESHOLD", "0.5"),
            imbalance_change_threshold: parse_decimal_env("STRATEGY_IMBALANCE_CHANGE_THRESHOLD", "2.0"),
            velocity_short_window_sec: env_or("STRATEGY_VELOCITY_SHORT_WINDOW_SEC", 3),
            velocity_long_window_sec: env_or("STRATEGY_VELOCITY_LONG_WINDOW_SEC", 15),
            volume_history_window_sec: env_or("STRATEGY_VOLUME_HISTORY_WINDOW_SEC", 10),
            trend_change_threshold_percent: parse_decimal_env("STRATEGY_TREND_CHANGE_THRESHOLD_PERCENT", "2.0"),
            trend_imbalance_ratio: parse_decimal_env("STRATEGY_TREND_IMBALANCE_RATIO", "1.5"),
            trend_refresh_interval: Duration::from_secs(env_or("STRATEGY_TREND_REFRESH_INTERVAL_SECS", 300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub connection_loss_timeout: Duration,
    pub emergency_close_all: bool,
    pub require_stop_loss: bool,
    pub max_api_retries: u32,
    pub min_balance_usdt: rust_decimal::Decimal,
    pub check_interval: Duration,
}

impl SafetyConfig {
    pub fn from_env() -> Self {
        Self {
            connection_loss_timeout: Duration::from_secs(env_or("SAFETY_CONNECTION_LOSS_TIMEOUT_SECS", 30)),
            emergency_close_all: env_or("SAFETY_EMERGENCY_CLOSE_ALL", true),
            require_stop_loss: env_or("SAFETY_REQUIRE_STOP_LOSS", true),
            max_api_retries: env_or("SAFETY_MAX_API_RETRIES", 5),
            min_balance_usdt: parse_decimal_env("SAFETY_MIN_BALANCE_USDT", "50"),
            check_interval: Duration::from_secs(env_or("SAFETY_CHECK_INTERVAL_SECS", 30)),
        }
    }
}

fn parse_decimal_env(key: &str, default: &str) -> rust_decimal::Decimal {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| default.parse().expect("default decimal literal must parse"))
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub exchange: ExchangeConfig,
    pub websocket: WebsocketConfig,
    pub market: MarketConfig,
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub safety: SafetyConfig,
    pub database_path: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            exchange: ExchangeConfig::from_env(),
            websocket: WebsocketConfig::from_env(),
            market: MarketConfig::from_env(),
            trading: TradingConfig::from_env(),
            strategy: StrategyConfig::from_env(),
            safety: SafetyConfig::from_env(),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "engine.db".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trading_config_defaults_are_sane() {
        let c = TradingConfig::from_env();
        assert!(c.leverage >= 1);
        assert!(c.max_concurrent_positions >= 1);
    }

    #[test]
    fn websocket_backoff_defaults_start_at_one_second_cap_thirty() {
        let c = WebsocketConfig::from_env();
        assert_eq!(c.reconnect_delay_initial, Duration::from_secs(1));
        assert_eq!(c.reconnect_delay_max, Duration::from_secs(30));
    }
}
