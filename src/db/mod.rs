//! Durable write path: database bootstrap and the batched logger.

mod bootstrap;
mod logger;

pub use bootstrap::{connect_pool, ensure_database, ensure_tables};
pub use logger::{BatchLogger, TradeSink};
