//! Coinbase Exchange feed.
//!
//! Per-pair shape: each instance owns one websocket subscription to the
//! `ticker` channel for a single product. Price is the last-trade field;
//! the RFC 3339 `time` field stamps the quote when present.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

use super::{reconnect_backoff, FeedState, PriceFeed, QuoteBoard};

const COINBASE_WSS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    product_id: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    time: Option<String>,
}

pub struct CoinbaseFeed {
    board: QuoteBoard,
    pair: String,
    /// `ETH/USDC` as Coinbase's `ETH-USDC`.
    product_id: String,
    connect_called: AtomicBool,
    /// Set on a subscription rejection; the ingest loop stops instead of
    /// reconnecting into the same rejection.
    rejected: AtomicBool,
}

impl CoinbaseFeed {
    pub fn new(pair: &str) -> Arc<Self> {
        Arc::new(Self {
            board: QuoteBoard::new("Coinbase"),
            pair: pair.to_string(),
            product_id: pair.replace('/', "-").to_ascii_uppercase(),
            connect_called: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
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
                    if self.rejected.load(Ordering::SeqCst) {
                        error!(product = %self.product_id, error = %e, "coinbase subscription rejected; feed stopped");
                        return;
                    }
                    error!(product = %self.product_id, error = %e, "coinbase stream failed");
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
        let (ws, _) = connect_async(COINBASE_WSS_URL)
            .await
            .context("connect coinbase feed")?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "product_ids": [self.product_id],
            "channels": ["ticker"],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send coinbase subscription")?;
        self.board.set_state(FeedState::Connected);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow!("coinbase stream ended"));
                    };
                    match msg.context("coinbase stream read")? {
                        Message::Text(text) => self.handle_text(&text)?,
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            return Err(anyhow!("coinbase closed the stream: {frame:?}"));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Errors only on a subscription rejection; bad ticks are skipped.
    fn handle_text(&self, text: &str) -> Result<()> {
        let msg: TickerMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "skipping unparseable coinbase message");
                return Ok(());
            }
        };

        match msg.kind.as_str() {
            "ticker" => {
                if msg.product_id != self.product_id {
                    return Ok(());
                }
                let Ok(price) = msg.price.parse::<f64>() else {
                    debug!(raw = %msg.price, "bad coinbase price field");
                    return Ok(());
                };
                let observed_at = msg
                    .time
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                self.board.record(&self.pair, price, observed_at);
            }
            // An unknown product is a configuration error for this venue;
            // reconnecting would only be rejected again.
            "error" => {
                self.rejected.store(true, Ordering::SeqCst);
                return Err(anyhow!("coinbase rejected subscription for {}: {text}", self.product_id));
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PriceFeed for CoinbaseFeed {
    fn name(&self) -> &'static str {
        "Coinbase"
    }

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            warn!(pair = %self.pair, "coinbase connect called twice; ignoring");
            return Ok(());
        }
        let shutdown = supervisor.subscribe();
        let name = format!("coinbase-feed:{}", self.pair);
        let feed = self.clone();
        supervisor.spawn(&name, feed.run(shutdown));
        Ok(())
    }

    fn latest(&self, pair: &str) -> Option<VenueQuote> {
        self.board.latest(pair)
    }
}
