//! Environment configuration and compile-time trading constants.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgConnectOptions;

/// Engine tick cadence (~5 Hz).
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum absolute spread (quote units) required to open a position.
pub const ABS_SPREAD_THRESHOLD: f64 = 0.05;
/// Minimum spread percent required to open a position.
pub const PCT_SPREAD_THRESHOLD: f64 = 0.40;
/// Spread percent at or under which an open position is closed.
pub const CONVERGENCE_THRESHOLD: f64 = 0.10;

/// Paper notional per entry, in quote currency.
pub const TRADE_NOTIONAL: f64 = 1000.0;
/// Taker fee, percent of notional per leg.
pub const FEE_PCT: f64 = 0.1;
/// Assumed slippage, percent per leg.
pub const SLIPPAGE_PCT: f64 = 0.05;

/// Fixed sleep between feeder reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Background flush cadence for the batched logger.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Combined opportunity+price buffer length that pokes an early flush.
pub const EARLY_FLUSH_ROWS: usize = 500;

/// Per-task join grace during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Connect options for the target database.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }

    /// Connect options for the `postgres` maintenance database, used only to
    /// create the target database when it does not exist yet.
    pub fn admin_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database("postgres")
            .username(&self.user)
            .password(&self.password)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub pairs: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("DB_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse::<u16>()
            .context("DB_PORT is not a valid port number")?;
        let name = std::env::var("DB_NAME").unwrap_or_else(|_| "arbitrage".to_string());
        let user = std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
        let password =
            std::env::var("DB_PASSWORD").context("DB_PASSWORD must be set (see settings.env)")?;

        let pairs: Vec<String> = std::env::var("PAIRS")
            .unwrap_or_else(|_| "ETH/USDC".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pairs.is_empty() {
            anyhow::bail!("PAIRS resolved to an empty list");
        }

        Ok(Self {
            db: DbConfig {
                host,
                port,
                name,
                user,
                password,
            },
            pairs,
        })
    }
}
