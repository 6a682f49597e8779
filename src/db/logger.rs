//! Batched, transactional event logger.
//!
//! The engine enqueues opportunity, price and trade events into in-memory
//! buffers behind one mutex and returns immediately. A background task
//! flushes the buffers every `FLUSH_INTERVAL` (and once more on shutdown)
//! inside a single transaction, linking each opportunity's snapshot quotes
//! to its freshly assigned row id.
//!
//! Delivery is at most once: the buffers are drained before the write is
//! attempted, so a failed commit loses that batch instead of stalling the
//! engine behind a broken writer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::EARLY_FLUSH_ROWS;
use crate::models::{OpportunityEvent, PricePoint, TradeEvent};
use crate::supervisor::Supervisor;

/// Non-blocking ingress the engine writes through. Implemented by
/// [`BatchLogger`] in production and by recording stubs in tests.
pub trait TradeSink: Send + Sync {
    fn log_opportunity(&self, event: OpportunityEvent);
    fn log_prices(&self, pair: &str, rows: Vec<PricePoint>);
    fn log_trade(&self, event: TradeEvent);
}

/// A row bound for `exchange_prices`. `arbitrage_id` is assigned during
/// flush for rows that belong to an opportunity's snapshot.
#[derive(Debug, Clone)]
struct PriceRow {
    pair: String,
    venue: String,
    price: f64,
    observed_at: DateTime<Utc>,
    arbitrage_id: Option<i32>,
}

#[derive(Debug)]
struct PendingOpportunity {
    detected_at: DateTime<Utc>,
    pair: String,
    buy_venue: String,
    buy_price: f64,
    sell_venue: String,
    sell_price: f64,
    spread: f64,
    spread_pct: f64,
    quotes: Vec<PriceRow>,
}

#[derive(Default)]
struct Buffers {
    opportunities: Vec<PendingOpportunity>,
    prices: Vec<PriceRow>,
    trades: Vec<TradeEvent>,
}

impl Buffers {
    fn is_empty(&self) -> bool {
        self.opportunities.is_empty() && self.prices.is_empty() && self.trades.is_empty()
    }

    /// Combined length the early-flush hint watches.
    fn row_pressure(&self) -> usize {
        self.opportunities.len() + self.prices.len()
    }
}

pub struct BatchLogger {
    pool: PgPool,
    flush_interval: Duration,
    buffers: Mutex<Buffers>,
    early_flush: Notify,
}

impl BatchLogger {
    pub fn new(pool: PgPool, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            pool,
            flush_interval,
            buffers: Mutex::new(Buffers::default()),
            early_flush: Notify::new(),
        })
    }

    /// Start the background flush timer. On shutdown the task drains the
    /// buffers one final time before exiting.
    pub fn spawn_flush_task(self: &Arc<Self>, supervisor: &Supervisor) {
        let logger = self.clone();
        let mut shutdown = supervisor.subscribe();
        supervisor.spawn("db-flush", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(logger.flush_interval) => {}
                    _ = logger.early_flush.notified() => {
                        debug!("large buffer detected, flushing early");
                    }
                    _ = shutdown.changed() => break,
                }
                logger.flush_logged().await;
            }
            logger.flush_logged().await;
            info!("database logger drained");
        });
    }

    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "failed to flush event buffers to database");
        }
    }

    /// Write everything buffered so far in one transaction.
    pub async fn flush(&self) -> Result<()> {
        let (opportunities, mut prices, trades) = {
            let mut buffers = self.buffers.lock();
            if buffers.is_empty() {
                return Ok(());
            }
            (
                std::mem::take(&mut buffers.opportunities),
                std::mem::take(&mut buffers.prices),
                std::mem::take(&mut buffers.trades),
            )
        };

        let opportunity_count = opportunities.len();
        let trade_count = trades.len();

        let mut tx = self.pool.begin().await.context("begin flush transaction")?;

        for opportunity in opportunities {
            let arbitrage_id: i32 = sqlx::query_scalar(
                r#"
                INSERT INTO arbitrage_opportunities
                    (timestamp, pair, buy_exchange, buy_price, sell_exchange, sell_price, spread, spread_pct)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(opportunity.detected_at)
            .bind(&opportunity.pair)
            .bind(&opportunity.buy_venue)
            .bind(opportunity.buy_price)
            .bind(&opportunity.sell_venue)
            .bind(opportunity.sell_price)
            .bind(opportunity.spread)
            .bind(opportunity.spread_pct)
            .fetch_one(&mut *tx)
            .await
            .context("insert arbitrage opportunity")?;

            for mut quote in opportunity.quotes {
                quote.arbitrage_id = Some(arbitrage_id);
                prices.push(quote);
            }
        }

        let price_count = prices.len();
        for row in &prices {
            sqlx::query(
                r#"
                INSERT INTO exchange_prices (pair, exchange_name, price, timestamp, arbitrage_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&row.pair)
            .bind(&row.venue)
            .bind(row.price)
            .bind(row.observed_at)
            .bind(row.arbitrage_id)
            .execute(&mut *tx)
            .await
            .context("insert exchange price")?;
        }

        for trade in &trades {
            sqlx::query(
                r#"
                INSERT INTO trade_log
                    (timestamp, pair, buy_exchange, buy_price, sell_exchange, sell_price,
                     spread, spread_pct, net_profit, gross_profit, event_type,
                     close_timestamp, exit_buy_price, exit_sell_price,
                     duration_seconds, decision_reason, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(trade.timestamp)
            .bind(&trade.pair)
            .bind(&trade.buy_venue)
            .bind(trade.buy_price)
            .bind(&trade.sell_venue)
            .bind(trade.sell_price)
            .bind(trade.spread)
            .bind(trade.spread_pct)
            .bind(trade.net_profit)
            .bind(trade.gross_profit)
            .bind(&trade.event_type)
            .bind(trade.close_timestamp)
            .bind(trade.exit_buy_price)
            .bind(trade.exit_sell_price)
            .bind(trade.duration_seconds)
            .bind(&trade.decision_reason)
            .bind(&trade.metadata)
            .execute(&mut *tx)
            .await
            .context("insert trade row")?;
        }

        tx.commit().await.context("commit flush transaction")?;
        debug!(
            opportunities = opportunity_count,
            prices = price_count,
            trades = trade_count,
            "flushed event buffers"
        );
        Ok(())
    }

    /// Buffered (opportunities, prices, trades) counts.
    pub fn pending(&self) -> (usize, usize, usize) {
        let buffers = self.buffers.lock();
        (
            buffers.opportunities.len(),
            buffers.prices.len(),
            buffers.trades.len(),
        )
    }

    fn poke_if_pressured(&self, buffers: &Buffers) {
        if buffers.row_pressure() > EARLY_FLUSH_ROWS {
            self.early_flush.notify_one();
        }
    }
}

impl TradeSink for BatchLogger {
    fn log_opportunity(&self, event: OpportunityEvent) {
        if event.snapshot.is_empty() {
            warn!(pair = %event.pair, "opportunity without snapshot quotes; skipping");
            return;
        }

        // Timestamps are normalized here, at ingest, so wall-clock strings
        // resolve against today's date now rather than at flush time.
        let quotes = event
            .snapshot
            .iter()
            .map(|p| PriceRow {
                pair: event.pair.clone(),
                venue: p.venue.clone(),
                price: p.price,
                observed_at: p.stamp.normalize(),
                arbitrage_id: None,
            })
            .collect();

        let mut buffers = self.buffers.lock();
        buffers.opportunities.push(PendingOpportunity {
            detected_at: Utc::now(),
            pair: event.pair,
            buy_venue: event.buy_venue,
            buy_price: event.buy_price,
            sell_venue: event.sell_venue,
            sell_price: event.sell_price,
            spread: event.spread,
            spread_pct: event.spread_pct,
            quotes,
        });
        self.poke_if_pressured(&buffers);
    }

    fn log_prices(&self, pair: &str, rows: Vec<PricePoint>) {
        let mut buffers = self.buffers.lock();
        for point in rows {
            buffers.prices.push(PriceRow {
                pair: pair.to_string(),
                venue: point.venue,
                price: point.price,
                observed_at: point.stamp.normalize(),
                arbitrage_id: None,
            });
        }
        self.poke_if_pressured(&buffers);
    }

    fn log_trade(&self, event: TradeEvent) {
        self.buffers.lock().trades.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteStamp;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    /// A pool that accepts enqueues but can never reach a server.
    fn unreachable_pool() -> PgPool {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .database("nowhere")
            .username("nobody")
            .password("nothing");
        PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy_with(options)
    }

    fn sample_point(venue: &str, price: f64, stamp: QuoteStamp) -> PricePoint {
        PricePoint {
            venue: venue.to_string(),
            price,
            stamp,
        }
    }

    #[tokio::test]
    async fn clock_stamps_are_normalized_at_ingest() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        logger.log_prices(
            "ETH/USDC",
            vec![sample_point("Binance", 3421.0, QuoteStamp::Clock("08:15:00".into()))],
        );

        let buffers = logger.buffers.lock();
        let row = &buffers.prices[0];
        assert_eq!(row.observed_at.date_naive(), Utc::now().date_naive());
        assert_eq!(row.observed_at.format("%H:%M:%S").to_string(), "08:15:00");
        assert!(row.arbitrage_id.is_none());
    }

    #[tokio::test]
    async fn buffer_pressure_pokes_the_early_flush() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        let rows: Vec<PricePoint> = (0..501)
            .map(|i| sample_point("Binance", 1.0 + i as f64, QuoteStamp::Utc(Utc::now())))
            .collect();
        logger.log_prices("ETH/USDC", rows);

        // notify_one stored a permit, so this resolves immediately.
        tokio::time::timeout(Duration::from_millis(100), logger.early_flush.notified())
            .await
            .expect("early flush should have been triggered");
    }

    #[tokio::test]
    async fn below_pressure_no_early_flush_is_signalled() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        logger.log_prices(
            "ETH/USDC",
            vec![sample_point("Binance", 3421.0, QuoteStamp::Utc(Utc::now()))],
        );

        let woke = tokio::time::timeout(Duration::from_millis(100), logger.early_flush.notified())
            .await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn empty_opportunity_snapshots_are_rejected() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        logger.log_opportunity(OpportunityEvent {
            pair: "ETH/USDC".into(),
            buy_venue: "A".into(),
            buy_price: 100.0,
            sell_venue: "B".into(),
            sell_price: 100.6,
            spread: 0.6,
            spread_pct: 0.6,
            snapshot: vec![],
        });
        assert_eq!(logger.pending(), (0, 0, 0));
    }

    #[tokio::test]
    async fn failed_flush_drains_buffers_and_accepts_new_events() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        logger.log_prices(
            "ETH/USDC",
            vec![sample_point("Binance", 3421.0, QuoteStamp::Utc(Utc::now()))],
        );
        logger.log_opportunity(OpportunityEvent {
            pair: "ETH/USDC".into(),
            buy_venue: "A".into(),
            buy_price: 100.0,
            sell_venue: "B".into(),
            sell_price: 100.6,
            spread: 0.6,
            spread_pct: 0.6,
            snapshot: vec![sample_point("A", 100.0, QuoteStamp::Utc(Utc::now()))],
        });

        let result = logger.flush().await;
        assert!(result.is_err());

        // At-most-once: the batch is gone even though the commit failed,
        // and the logger keeps accepting events.
        assert_eq!(logger.pending(), (0, 0, 0));
        logger.log_prices(
            "ETH/USDC",
            vec![sample_point("Kraken", 3420.5, QuoteStamp::Utc(Utc::now()))],
        );
        assert_eq!(logger.pending(), (0, 1, 0));
    }

    #[tokio::test]
    async fn flush_on_empty_buffers_is_a_no_op() {
        let logger = BatchLogger::new(unreachable_pool(), Duration::from_secs(10));
        // Must not even try to reach the (unreachable) database.
        logger.flush().await.expect("empty flush should succeed");
    }
}
