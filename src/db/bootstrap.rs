//! Database bootstrap: create the database if missing, apply the schema.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

const CREATE_ARBITRAGE_OPPORTUNITIES: &str = r#"
CREATE TABLE IF NOT EXISTS arbitrage_opportunities (
    id SERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    pair TEXT NOT NULL,
    buy_exchange TEXT NOT NULL,
    buy_price NUMERIC(18,4) NOT NULL,
    sell_exchange TEXT NOT NULL,
    sell_price NUMERIC(18,4) NOT NULL,
    spread NUMERIC(18,4),
    spread_pct NUMERIC(6,4)
);
"#;

const CREATE_EXCHANGE_PRICES: &str = r#"
CREATE TABLE IF NOT EXISTS exchange_prices (
    id SERIAL PRIMARY KEY,
    pair TEXT NOT NULL,
    exchange_name TEXT NOT NULL,
    price NUMERIC(18,4) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    arbitrage_id INTEGER REFERENCES arbitrage_opportunities(id) ON DELETE SET NULL
);
"#;

const CREATE_TRADE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS trade_log (
    id SERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    pair TEXT NOT NULL,
    buy_exchange TEXT NOT NULL,
    buy_price NUMERIC(18,4) NOT NULL,
    sell_exchange TEXT NOT NULL,
    sell_price NUMERIC(18,4) NOT NULL,
    spread NUMERIC(18,4),
    spread_pct NUMERIC(6,4),
    net_profit NUMERIC(18,4),
    gross_profit NUMERIC(18,4),
    event_type TEXT NOT NULL DEFAULT 'ENTRY',
    close_timestamp TIMESTAMPTZ,
    exit_buy_price NUMERIC(18,4),
    exit_sell_price NUMERIC(18,4),
    duration_seconds INTEGER,
    decision_reason TEXT,
    metadata JSONB
);
"#;

/// Create the target database when it does not exist, via an administrative
/// connection to the `postgres` maintenance database.
pub async fn ensure_database(cfg: &DbConfig) -> Result<()> {
    let mut conn = PgConnection::connect_with(&cfg.admin_options())
        .await
        .context("connect to postgres maintenance database")?;

    let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(&cfg.name)
        .fetch_optional(&mut conn)
        .await
        .context("check whether target database exists")?;

    if exists.is_none() {
        // Database names cannot be bound as parameters.
        let ddl = format!("CREATE DATABASE \"{}\"", cfg.name.replace('"', "\"\""));
        conn.execute(ddl.as_str())
            .await
            .with_context(|| format!("create database {}", cfg.name))?;
        info!(database = %cfg.name, "created database");
    }

    let _ = conn.close().await;
    Ok(())
}

pub async fn connect_pool(cfg: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(4)
        .connect_with(cfg.connect_options())
        .await
        .context("connect database pool")
}

/// Idempotent: safe to run on every startup.
pub async fn ensure_tables(pool: &PgPool) -> Result<()> {
    for ddl in [
        CREATE_ARBITRAGE_OPPORTUNITIES,
        CREATE_EXCHANGE_PRICES,
        CREATE_TRADE_LOG,
    ] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("apply schema DDL")?;
    }
    Ok(())
}
