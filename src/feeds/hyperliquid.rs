//! Hyperliquid feed (the DEX case).
//!
//! Multi-pair shape: one websocket carrying an `l2Book` subscription per
//! configured pair. Hyperliquid publishes no last-trade ticker on this
//! channel, so the price is derived as the arithmetic mean of the best bid
//! and best ask; book updates missing either side are dropped. Only
//! USDC-quoted pairs exist on the venue, anything else is a configuration
//! error at construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

use super::{reconnect_backoff, venue_timestamp, FeedState, PriceFeed, QuoteBoard};

const HYPERLIQUID_WSS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// The server drops connections idle for 60 s.
const PING_INTERVAL: Duration = Duration::from_secs(50);

#[derive(Debug, Deserialize)]
struct BookLevel {
    px: String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    coin: String,
    #[serde(default)]
    time: Option<i64>,
    /// `levels[0]` bids, `levels[1]` asks, best first.
    levels: Vec<Vec<BookLevel>>,
}

#[derive(Debug)]
pub struct HyperliquidFeed {
    board: QuoteBoard,
    /// Venue coin (`ETH`) back to pair (`ETH/USDC`).
    coin_to_pair: HashMap<String, String>,
    connect_called: AtomicBool,
}

impl HyperliquidFeed {
    /// Fails when a configured pair is not USDC-quoted; that misconfiguration
    /// is fatal for this venue only.
    pub fn new(pairs: Vec<String>) -> Result<Arc<Self>> {
        let mut coin_to_pair = HashMap::new();
        for pair in &pairs {
            let (base, quote) = pair
                .split_once('/')
                .with_context(|| format!("malformed pair {pair}"))?;
            if quote != "USDC" {
                bail!("hyperliquid only lists USDC-quoted pairs, got {pair}");
            }
            coin_to_pair.insert(base.to_string(), pair.clone());
        }
        Ok(Arc::new(Self {
            board: QuoteBoard::new("Hyperliquid"),
            coin_to_pair,
            connect_called: AtomicBool::new(false),
        }))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.stream_once(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    self.board.set_state(FeedState::Disconnected);
                    error!(error = %e, "hyperliquid stream failed");
                }
            }
            self.board.set_state(FeedState::Reconnecting);
            if !reconnect_backoff(&mut shutdown).await {
                break;
            }
        }
        self.board.set_state(FeedState::Disconnected);
    }

    async fn stream_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let (ws, _) = connect_async(HYPERLIQUID_WSS_URL)
            .await
            .context("connect hyperliquid feed")?;
        let (mut write, mut read) = ws.split();

        for coin in self.coin_to_pair.keys() {
            let subscribe = serde_json::json!({
                "method": "subscribe",
                "subscription": { "type": "l2Book", "coin": coin },
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .with_context(|| format!("subscribe hyperliquid l2Book for {coin}"))?;
        }
        self.board.set_state(FeedState::Connected);

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let _ = write
                        .send(Message::Text(r#"{"method":"ping"}"#.to_string()))
                        .await;
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("hyperliquid stream ended"));
                    };
                    match msg.context("hyperliquid stream read")? {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            return Err(anyhow!("hyperliquid closed the stream: {frame:?}"));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let json: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        if json.get("channel").and_then(|c| c.as_str()) != Some("l2Book") {
            return;
        }
        let Some(data) = json.get("data").cloned() else {
            return;
        };
        let book: BookData = match serde_json::from_value(data) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "failed to parse hyperliquid book");
                return;
            }
        };

        let Some(pair) = self.coin_to_pair.get(&book.coin) else {
            debug!(coin = %book.coin, "book for unsubscribed coin");
            return;
        };

        let Some(mid) = mid_from_book(&book) else {
            debug!(coin = %book.coin, "book missing a side, dropping update");
            return;
        };

        self.board.record(pair, mid, venue_timestamp(book.time));
    }
}

/// Mean of best bid and best ask, or `None` when either side is missing.
fn mid_from_book(book: &BookData) -> Option<f64> {
    let best_bid = book.levels.first()?.first()?.px.parse::<f64>().ok()?;
    let best_ask = book.levels.get(1)?.first()?.px.parse::<f64>().ok()?;
    Some((best_bid + best_ask) / 2.0)
}

#[async_trait]
impl PriceFeed for HyperliquidFeed {
    fn name(&self) -> &'static str {
        "Hyperliquid"
    }

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            warn!("hyperliquid connect called twice; ignoring");
            return Ok(());
        }
        let shutdown = supervisor.subscribe();
        let feed = self.clone();
        supervisor.spawn("hyperliquid-feed", feed.run(shutdown));
        Ok(())
    }

    fn latest(&self, pair: &str) -> Option<VenueQuote> {
        self.board.latest(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_usdc_quote_is_a_config_error() {
        let err = HyperliquidFeed::new(vec!["ETH/USDT".into()]).unwrap_err();
        assert!(err.to_string().contains("USDC"));
    }

    #[test]
    fn mid_price_from_best_levels() {
        let feed = HyperliquidFeed::new(vec!["ETH/USDC".into()]).unwrap();
        feed.handle_text(
            r#"{"channel":"l2Book","data":{"coin":"ETH","time":1700000000000,
                "levels":[[{"px":"3419.0","sz":"2.0","n":4},{"px":"3418.5","sz":"1.1","n":2}],
                          [{"px":"3421.0","sz":"0.7","n":1},{"px":"3421.5","sz":"3.3","n":5}]]}}"#,
        );

        let quote = feed.latest("ETH/USDC").unwrap();
        assert_eq!(quote.price, 3420.0);
        assert_eq!(quote.observed_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn one_sided_book_is_dropped() {
        let feed = HyperliquidFeed::new(vec!["ETH/USDC".into()]).unwrap();
        feed.handle_text(
            r#"{"channel":"l2Book","data":{"coin":"ETH","time":1700000000000,
                "levels":[[{"px":"3419.0","sz":"2.0","n":4}],[]]}}"#,
        );
        assert!(feed.latest("ETH/USDC").is_none());
    }

    #[test]
    fn subscription_acks_are_ignored() {
        let feed = HyperliquidFeed::new(vec!["ETH/USDC".into()]).unwrap();
        feed.handle_text(
            r#"{"channel":"subscriptionResponse","data":{"method":"subscribe","subscription":{"type":"l2Book","coin":"ETH"}}}"#,
        );
        assert!(feed.latest("ETH/USDC").is_none());
    }
}
