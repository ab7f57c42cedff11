//! Trading engine entrypoint: parse args, init logging, load config, bootstrap
//! the Orchestrator against a live Bybit client, and run until shutdown.

use std::path::Path;

use density_trading_engine::config::EngineConfig;
use density_trading_engine::exchange::BybitClient;
use density_trading_engine::market_data::BybitMarketDataSource;
use density_trading_engine::orchestrator::Orchestrator;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "trading-engine")]
#[command(about = "Orderbook-density breakout/bounce trading engine")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    load_env();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting trading engine");

    let config = EngineConfig::from_env();
    info!(testnet = config.exchange.testnet, db = %config.database_path, "configuration loaded");

    let client = Arc::new(BybitClient::new(config.exchange.clone()));
    let market_data = Arc::new(BybitMarketDataSource::new(
        config.exchange.base_url.clone(),
        config.market.min_24h_volume,
        config.market.top_gainers_count,
        config.market.top_losers_count,
    ));

    let orchestrator = Arc::new(Orchestrator::bootstrap(config, client, market_data).await?);
    orchestrator.run().await?;

    info!("trading engine shut down cleanly");
    Ok(())
}

fn load_env() {
    let _ = dotenv::dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
