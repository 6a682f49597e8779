//! Spreadwatch: live cross-venue arbitrage monitor.
//!
//! Streams spot prices from several centralized and decentralized venues,
//! detects spread dispersion per pair, paper-trades the entry/exit cycle
//! with fee- and slippage-adjusted PnL, and persists prices, opportunities
//! and simulated trades to PostgreSQL in batched transactions.

pub mod config;
pub mod db;
pub mod engine;
pub mod feeds;
pub mod matrix;
pub mod models;
pub mod supervisor;
