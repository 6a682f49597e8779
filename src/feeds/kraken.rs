//! Kraken spot feed.
//!
//! Multi-pair shape: one websocket (v2 API) subscribed to the `ticker`
//! channel for every configured pair in a single request. Kraken's v2
//! symbols already use the `BASE/QUOTE` form, so no symbol translation is
//! needed. Price is the `last` trade field; quotes are stamped at receipt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

use super::{reconnect_backoff, FeedState, PriceFeed, QuoteBoard};

const KRAKEN_WSS_URL: &str = "wss://ws.kraken.com/v2";

#[derive(Debug, Deserialize)]
struct TickerData {
    symbol: String,
    last: f64,
}

pub struct KrakenFeed {
    board: QuoteBoard,
    pairs: Vec<String>,
    connect_called: AtomicBool,
}

impl KrakenFeed {
    pub fn new(pairs: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            board: QuoteBoard::new("Kraken"),
            pairs,
            connect_called: AtomicBool::new(false),
        })
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
                    error!(error = %e, "kraken stream failed");
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
        let (ws, _) = connect_async(KRAKEN_WSS_URL)
            .await
            .context("connect kraken feed")?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "method": "subscribe",
            "params": {
                "channel": "ticker",
                "symbol": self.pairs,
            },
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send kraken subscription")?;
        self.board.set_state(FeedState::Connected);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("kraken stream ended"));
                    };
                    match msg.context("kraken stream read")? {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            return Err(anyhow!("kraken closed the stream: {frame:?}"));
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

        // Heartbeats, status and subscribe acks share the socket; only
        // ticker payloads matter here.
        if json.get("channel").and_then(|c| c.as_str()) != Some("ticker") {
            if json.get("success").and_then(|s| s.as_bool()) == Some(false) {
                warn!(response = %text, "kraken rejected a subscription");
            }
            return;
        }

        let Some(data) = json.get("data").cloned() else {
            return;
        };
        let tickers: Vec<TickerData> = match serde_json::from_value(data) {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "failed to parse kraken ticker payload");
                return;
            }
        };

        for ticker in tickers {
            // Kraken echoes the symbol in our own pair notation.
            self.board.record(&ticker.symbol, ticker.last, Utc::now());
        }
    }
}

#[async_trait]
impl PriceFeed for KrakenFeed {
    fn name(&self) -> &'static str {
        "Kraken"
    }

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            warn!("kraken connect called twice; ignoring");
            return Ok(());
        }
        let shutdown = supervisor.subscribe();
        let feed = self.clone();
        supervisor.spawn("kraken-feed", feed.run(shutdown));
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
    fn ticker_updates_roll_into_the_cache() {
        let feed = KrakenFeed::new(vec!["ETH/USDC".into(), "ADA/USDC".into()]);
        feed.handle_text(
            r#"{"channel":"ticker","type":"update","data":[{"symbol":"ETH/USDC","last":3419.8,"bid":3419.5,"ask":3420.1}]}"#,
        );
        feed.handle_text(
            r#"{"channel":"ticker","type":"update","data":[{"symbol":"ADA/USDC","last":0.4411}]}"#,
        );

        assert_eq!(feed.latest("ETH/USDC").unwrap().price, 3419.8);
        assert_eq!(feed.latest("ADA/USDC").unwrap().price, 0.4411);
    }

    #[test]
    fn heartbeats_and_acks_are_ignored() {
        let feed = KrakenFeed::new(vec!["ETH/USDC".into()]);
        feed.handle_text(r#"{"channel":"heartbeat"}"#);
        feed.handle_text(
            r#"{"method":"subscribe","result":{"channel":"ticker","symbol":"ETH/USDC"},"success":true,"time_in":"t","time_out":"t"}"#,
        );
        assert!(feed.latest("ETH/USDC").is_none());
    }
}
