//! Binance spot feed.
//!
//! Multi-pair shape: one combined-stream websocket carries the `@ticker`
//! channel for every configured pair. Price is the last-trade field; the
//! exchange event time (ms epoch) stamps the quote.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

use super::{reconnect_backoff, venue_timestamp, FeedState, PriceFeed, QuoteBoard};

const BINANCE_WSS_BASE: &str = "wss://stream.binance.com:9443/stream";

#[derive(Debug, Deserialize)]
struct CombinedMsg {
    #[allow(dead_code)]
    stream: String,
    data: TickerMsg,
}

#[derive(Debug, Deserialize)]
struct TickerMsg {
    /// Symbol, e.g. `ETHUSDC`.
    #[serde(rename = "s")]
    symbol: String,
    /// Last trade price.
    #[serde(rename = "c")]
    last: String,
    /// Event time, ms epoch.
    #[serde(rename = "E")]
    event_time: Option<i64>,
}

pub struct BinanceFeed {
    board: QuoteBoard,
    pairs: Vec<String>,
    /// `ETHUSDC` back to `ETH/USDC`.
    symbol_to_pair: HashMap<String, String>,
    connect_called: AtomicBool,
}

impl BinanceFeed {
    pub fn new(pairs: Vec<String>) -> Arc<Self> {
        let symbol_to_pair = pairs
            .iter()
            .map(|p| (p.replace('/', "").to_ascii_uppercase(), p.clone()))
            .collect();
        Arc::new(Self {
            board: QuoteBoard::new("Binance"),
            pairs,
            symbol_to_pair,
            connect_called: AtomicBool::new(false),
        })
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .pairs
            .iter()
            .map(|p| format!("{}@ticker", p.replace('/', "").to_ascii_lowercase()))
            .collect();
        format!("{}?streams={}", BINANCE_WSS_BASE, streams.join("/"))
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
                    error!(error = %e, "binance stream failed");
                }
            }
            self.board.set_state(FeedState::Reconnecting);
            if !reconnect_backoff(&mut shutdown).await {
                break;
            }
        }
        self.board.set_state(FeedState::Disconnected);
    }

    /// One websocket session. Returns `Ok` only when shutdown was requested.
    async fn stream_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = self.stream_url();
        let (ws, _) = connect_async(&url)
            .await
            .context("connect binance combined stream")?;
        self.board.set_state(FeedState::Connected);

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("binance stream ended"));
                    };
                    match msg.context("binance stream read")? {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            return Err(anyhow!("binance closed the stream: {frame:?}"));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let msg: CombinedMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "skipping unparseable binance message");
                return;
            }
        };

        let Some(pair) = self.symbol_to_pair.get(&msg.data.symbol) else {
            debug!(symbol = %msg.data.symbol, "ticker for unsubscribed symbol");
            return;
        };

        match msg.data.last.parse::<f64>() {
            Ok(price) => {
                self.board
                    .record(pair, price, venue_timestamp(msg.data.event_time));
            }
            Err(e) => debug!(error = %e, raw = %msg.data.last, "bad binance price field"),
        }
    }
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            warn!("binance connect called twice; ignoring");
            return Ok(());
        }
        let shutdown = supervisor.subscribe();
        let feed = self.clone();
        supervisor.spawn("binance-feed", feed.run(shutdown));
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
    fn combined_stream_url_covers_all_pairs() {
        let feed = BinanceFeed::new(vec!["ETH/USDC".into(), "ADA/USDC".into()]);
        assert_eq!(
            feed.stream_url(),
            "wss://stream.binance.com:9443/stream?streams=ethusdc@ticker/adausdc@ticker"
        );
    }

    #[test]
    fn ticker_message_updates_the_cache() {
        let feed = BinanceFeed::new(vec!["ETH/USDC".into()]);
        feed.handle_text(
            r#"{"stream":"ethusdc@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"ETHUSDC","c":"3421.57"}}"#,
        );

        let quote = feed.latest("ETH/USDC").unwrap();
        assert_eq!(quote.price, 3421.57);
        assert_eq!(quote.observed_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn junk_and_unknown_symbols_are_skipped() {
        let feed = BinanceFeed::new(vec!["ETH/USDC".into()]);
        feed.handle_text("not json");
        feed.handle_text(
            r#"{"stream":"solusdc@ticker","data":{"s":"SOLUSDC","c":"147.2","E":null}}"#,
        );
        feed.handle_text(
            r#"{"stream":"ethusdc@ticker","data":{"s":"ETHUSDC","c":"garbage","E":null}}"#,
        );
        assert!(feed.latest("ETH/USDC").is_none());
    }
}
