//! Venue price feeds.
//!
//! Each venue module hides its wire protocol behind [`PriceFeed`]: a feed is
//! connected once, runs a perpetual ingest task that keeps a latest-quote
//! cache fresh, and answers non-blocking `latest` lookups from the matrix.
//! Two shapes coexist: multi-pair feeds multiplex every configured pair over
//! one subscription (Binance, Kraken, Hyperliquid), per-pair feeds bind one
//! instance to one pair (Coinbase, Jupiter).

pub mod binance;
pub mod coinbase;
pub mod hyperliquid;
pub mod jupiter;
pub mod kraken;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RECONNECT_BACKOFF;
use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

pub use binance::BinanceFeed;
pub use coinbase::CoinbaseFeed;
pub use hyperliquid::HyperliquidFeed;
pub use jupiter::JupiterFeed;
pub use kraken::KrakenFeed;

/// Connection state of a feed's ingest loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Uniform capability set every venue implements.
///
/// `connect` starts the background ingest task (registered with the
/// supervisor) and returns once it is running; it does not wait for the
/// first message. Calling `connect` twice is a logged no-op.
///
/// `latest` is non-blocking and safe to call concurrently with the ingest
/// task; it returns the most recent quote seen for `pair`, if any.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()>;

    fn latest(&self, pair: &str) -> Option<VenueQuote>;
}

/// Latest-quote cache shared between one ingest task (writer) and the
/// matrix (readers). A per-pair feed simply keeps a single entry.
#[derive(Debug)]
pub(crate) struct QuoteBoard {
    venue: &'static str,
    quotes: RwLock<HashMap<String, VenueQuote>>,
    state: RwLock<FeedState>,
}

impl QuoteBoard {
    pub(crate) fn new(venue: &'static str) -> Self {
        Self {
            venue,
            quotes: RwLock::new(HashMap::new()),
            state: RwLock::new(FeedState::Disconnected),
        }
    }

    /// Record a fresh quote. Non-positive prices are dropped at this
    /// boundary so the engine never sees them.
    pub(crate) fn record(&self, pair: &str, price: f64, observed_at: DateTime<Utc>) {
        if !price.is_finite() || price <= 0.0 {
            debug!(venue = self.venue, pair, price, "dropping non-positive quote");
            return;
        }
        self.quotes.write().insert(
            pair.to_string(),
            VenueQuote {
                venue: self.venue.to_string(),
                price,
                observed_at,
            },
        );
    }

    pub(crate) fn latest(&self, pair: &str) -> Option<VenueQuote> {
        self.quotes.read().get(pair).cloned()
    }

    pub(crate) fn set_state(&self, next: FeedState) {
        let mut state = self.state.write();
        if *state != next {
            match next {
                FeedState::Connected => info!(venue = self.venue, "feed connected"),
                FeedState::Disconnected => warn!(venue = self.venue, "feed disconnected"),
                FeedState::Reconnecting => info!(venue = self.venue, "feed reconnecting"),
            }
            *state = next;
        }
    }

    pub(crate) fn state(&self) -> FeedState {
        *self.state.read()
    }
}

/// Sleep out the fixed reconnect backoff, racing the shutdown signal.
/// Returns `false` when shutdown was requested during the sleep.
pub(crate) async fn reconnect_backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => true,
        _ = shutdown.changed() => false,
    }
}

/// Millisecond epoch from a venue, or the local wall clock when absent.
pub(crate) fn venue_timestamp(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_rejects_non_positive_prices() {
        let board = QuoteBoard::new("TestVenue");
        board.record("ETH/USDC", 0.0, Utc::now());
        board.record("ETH/USDC", -1.5, Utc::now());
        board.record("ETH/USDC", f64::NAN, Utc::now());
        assert!(board.latest("ETH/USDC").is_none());

        board.record("ETH/USDC", 3120.25, Utc::now());
        let quote = board.latest("ETH/USDC").unwrap();
        assert_eq!(quote.venue, "TestVenue");
        assert_eq!(quote.price, 3120.25);
    }

    #[test]
    fn board_keeps_most_recent_quote_per_pair() {
        let board = QuoteBoard::new("TestVenue");
        board.record("ETH/USDC", 3120.0, Utc::now());
        board.record("ETH/USDC", 3121.0, Utc::now());
        board.record("ADA/USDC", 0.44, Utc::now());

        assert_eq!(board.latest("ETH/USDC").unwrap().price, 3121.0);
        assert_eq!(board.latest("ADA/USDC").unwrap().price, 0.44);
        assert!(board.latest("SOL/USDC").is_none());
    }

    #[test]
    fn venue_timestamp_converts_epoch_millis() {
        let ts = venue_timestamp(Some(1_700_000_000_000));
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn state_transitions_are_tracked() {
        let board = QuoteBoard::new("TestVenue");
        assert_eq!(board.state(), FeedState::Disconnected);
        board.set_state(FeedState::Connected);
        board.set_state(FeedState::Connected); // repeat is a no-op
        assert_eq!(board.state(), FeedState::Connected);
        board.set_state(FeedState::Reconnecting);
        assert_eq!(board.state(), FeedState::Reconnecting);
    }
}
