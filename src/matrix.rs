//! Registry of venue feeds keyed by pair.
//!
//! Built once at startup (append-only) and then shared immutably with the
//! engine. A snapshot polls every feed registered for the pair and keeps
//! whatever quotes exist right now; it never filters, sorts or thresholds.
//! Stopping the feeds is the supervisor's job, which owns their ingest task
//! handles and the shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::feeds::PriceFeed;
use crate::models::VenueQuote;

#[derive(Default)]
pub struct MarketMatrix {
    feeds: HashMap<String, Vec<Arc<dyn PriceFeed>>>,
    /// Pairs in registration order, for a stable engine iteration order.
    pairs: Vec<String>,
}

impl MarketMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feed for a pair. Startup only.
    pub fn add(&mut self, pair: &str, feed: Arc<dyn PriceFeed>) {
        if !self.feeds.contains_key(pair) {
            self.pairs.push(pair.to_string());
        }
        self.feeds.entry(pair.to_string()).or_default().push(feed);
    }

    pub fn pairs(&self) -> &[String] {
        &self.pairs
    }

    pub fn venue_count(&self, pair: &str) -> usize {
        self.feeds.get(pair).map_or(0, Vec::len)
    }

    /// Most-recent quote from every registered feed for `pair`. Feeds that
    /// have not seen a quote yet are simply absent; order is meaningless.
    pub fn snapshot(&self, pair: &str) -> Vec<VenueQuote> {
        self.feeds
            .get(pair)
            .map(|feeds| feeds.iter().filter_map(|f| f.latest(pair)).collect())
            .unwrap_or_default()
    }
}
