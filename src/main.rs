//! Process bootstrap: configuration, database, feeds, engine, shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spreadwatch::config::{Config, FLUSH_INTERVAL, SHUTDOWN_GRACE};
use spreadwatch::db::{self, BatchLogger};
use spreadwatch::engine::ArbitrageEngine;
use spreadwatch::feeds::{
    BinanceFeed, CoinbaseFeed, HyperliquidFeed, JupiterFeed, KrakenFeed, PriceFeed,
};
use spreadwatch::matrix::MarketMatrix;
use spreadwatch::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(pairs = ?config.pairs, "🚀 spreadwatch starting");

    db::ensure_database(&config.db)
        .await
        .context("database bootstrap")?;
    let pool = db::connect_pool(&config.db).await?;
    db::ensure_tables(&pool).await?;
    info!(database = %config.db.name, "💾 schema ready");

    let supervisor = Supervisor::new();
    let logger = BatchLogger::new(pool.clone(), FLUSH_INTERVAL);
    logger.spawn_flush_task(&supervisor);

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build http client")?;

    let mut matrix = MarketMatrix::new();

    // Multi-pair venues: one connection multiplexes every configured pair.
    let binance = BinanceFeed::new(config.pairs.clone());
    match binance.clone().connect(&supervisor).await {
        Ok(()) => {
            for pair in &config.pairs {
                matrix.add(pair, binance.clone());
            }
        }
        Err(e) => error!(venue = "Binance", error = %e, "venue disabled at startup"),
    }

    let kraken = KrakenFeed::new(config.pairs.clone());
    match kraken.clone().connect(&supervisor).await {
        Ok(()) => {
            for pair in &config.pairs {
                matrix.add(pair, kraken.clone());
            }
        }
        Err(e) => error!(venue = "Kraken", error = %e, "venue disabled at startup"),
    }

    match HyperliquidFeed::new(config.pairs.clone()) {
        Ok(hyperliquid) => match hyperliquid.clone().connect(&supervisor).await {
            Ok(()) => {
                for pair in &config.pairs {
                    matrix.add(pair, hyperliquid.clone());
                }
            }
            Err(e) => error!(venue = "Hyperliquid", error = %e, "venue disabled at startup"),
        },
        Err(e) => error!(venue = "Hyperliquid", error = %e, "venue disabled at startup"),
    }

    // Per-pair venues: one instance per configured pair.
    for pair in &config.pairs {
        let coinbase = CoinbaseFeed::new(pair);
        match coinbase.clone().connect(&supervisor).await {
            Ok(()) => matrix.add(pair, coinbase),
            Err(e) => error!(venue = "Coinbase", pair = %pair, error = %e, "venue disabled for pair"),
        }

        match JupiterFeed::create(http_client.clone(), pair).await {
            Ok(jupiter) => match jupiter.clone().connect(&supervisor).await {
                Ok(()) => matrix.add(pair, jupiter),
                Err(e) => error!(venue = "Jupiter", pair = %pair, error = %e, "venue disabled for pair"),
            },
            Err(e) => error!(venue = "Jupiter", pair = %pair, error = %e, "venue disabled for pair"),
        }
    }

    for pair in &config.pairs {
        let venues = matrix.venue_count(pair);
        if venues < 2 {
            warn!(pair = %pair, venues, "fewer than two live venues; pair cannot trade");
        }
    }

    let matrix = Arc::new(matrix);
    let engine = ArbitrageEngine::new(matrix, logger.clone());
    let engine_shutdown = supervisor.subscribe();
    supervisor.spawn("engine", engine.run(engine_shutdown));

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    info!("🛑 shutdown requested");

    supervisor.shutdown(SHUTDOWN_GRACE).await;
    pool.close().await;
    info!("shutdown complete");
    Ok(())
}
