//! Jupiter aggregator feed (Solana DEX liquidity).
//!
//! Per-pair shape with a REST ingest loop: no stream exists, so the task
//! polls the quote API for a fixed probe size and derives the price from the
//! quoted out-amount. Mint addresses and decimals are resolved once at
//! construction from the verified token list; an unknown token there is a
//! configuration error fatal to this venue only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::models::VenueQuote;
use crate::supervisor::Supervisor;

use super::{reconnect_backoff, FeedState, PriceFeed, QuoteBoard};

const TOKEN_LIST_URL: &str = "https://lite-api.jup.ag/tokens/v1/tagged/verified";
const QUOTE_URL: &str = "https://quote-api.jup.ag/v6/quote";

/// Probe size, in whole units of the base token.
const PROBE_UNITS: f64 = 10.0;
const SLIPPAGE_BPS: u32 = 50;
/// Floor between successive quote requests.
const QUOTE_COOLDOWN: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    decimals: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    out_amount: String,
}

pub struct JupiterFeed {
    board: QuoteBoard,
    client: reqwest::Client,
    /// Pair under its configured name; lookups and cache keys use this.
    pair: String,
    input_mint: String,
    output_mint: String,
    /// Probe amount in base-token atomic units.
    amount: String,
    out_decimals: u32,
    connect_called: AtomicBool,
}

impl JupiterFeed {
    /// Resolve mints for `pair` and build the feed. BTC trades as wrapped
    /// WBTC on Solana, so that base symbol is rewritten before lookup.
    pub async fn create(client: reqwest::Client, pair: &str) -> Result<Arc<Self>> {
        let venue_pair = pair.to_ascii_uppercase().replace("BTC", "WBTC");
        let (base, quote) = venue_pair
            .split_once('/')
            .with_context(|| format!("malformed pair {pair}"))?;

        let tokens: Vec<TokenInfo> = client
            .get(TOKEN_LIST_URL)
            .send()
            .await
            .context("fetch jupiter token list")?
            .error_for_status()
            .context("jupiter token list status")?
            .json()
            .await
            .context("decode jupiter token list")?;

        let lookup = |symbol: &str| -> Option<(&TokenInfo, u32)> {
            tokens
                .iter()
                .find(|t| t.symbol.eq_ignore_ascii_case(symbol) && !t.address.is_empty())
                .and_then(|t| t.decimals.map(|d| (t, d)))
        };

        let Some((base_token, base_decimals)) = lookup(base) else {
            bail!("jupiter verified list has no token {base}");
        };
        let Some((quote_token, quote_decimals)) = lookup(quote) else {
            bail!("jupiter verified list has no token {quote}");
        };

        let amount = (PROBE_UNITS * 10f64.powi(base_decimals as i32)) as u128;

        Ok(Arc::new(Self {
            board: QuoteBoard::new("Jupiter"),
            client,
            pair: pair.to_string(),
            input_mint: base_token.address.clone(),
            output_mint: quote_token.address.clone(),
            amount: amount.to_string(),
            out_decimals: quote_decimals,
            connect_called: AtomicBool::new(false),
        }))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.fetch_price().await {
                Ok(price) => {
                    self.board.set_state(FeedState::Connected);
                    self.board.record(&self.pair, price, Utc::now());
                    tokio::select! {
                        _ = tokio::time::sleep(QUOTE_COOLDOWN) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    self.board.set_state(FeedState::Disconnected);
                    error!(pair = %self.pair, error = %e, "jupiter quote failed");
                    self.board.set_state(FeedState::Reconnecting);
                    if !reconnect_backoff(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        self.board.set_state(FeedState::Disconnected);
    }

    async fn fetch_price(&self) -> Result<f64> {
        let slippage = SLIPPAGE_BPS.to_string();
        let response: QuoteResponse = self
            .client
            .get(QUOTE_URL)
            .query(&[
                ("inputMint", self.input_mint.as_str()),
                ("outputMint", self.output_mint.as_str()),
                ("amount", self.amount.as_str()),
                ("slippageBps", slippage.as_str()),
            ])
            .send()
            .await
            .context("jupiter quote request")?
            .error_for_status()
            .context("jupiter quote status")?
            .json()
            .await
            .context("decode jupiter quote")?;

        let out_amount: f64 = response
            .out_amount
            .parse()
            .context("jupiter outAmount is not numeric")?;

        Ok(quoted_price(out_amount, self.out_decimals))
    }
}

/// Quote-per-base price implied by the out-amount of a probe swap.
fn quoted_price(out_amount: f64, out_decimals: u32) -> f64 {
    out_amount / 10f64.powi(out_decimals as i32) / PROBE_UNITS
}

#[async_trait]
impl PriceFeed for JupiterFeed {
    fn name(&self) -> &'static str {
        "Jupiter"
    }

    async fn connect(self: Arc<Self>, supervisor: &Supervisor) -> Result<()> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            warn!(pair = %self.pair, "jupiter connect called twice; ignoring");
            return Ok(());
        }
        let shutdown = supervisor.subscribe();
        let name = format!("jupiter-feed:{}", self.pair);
        let feed = self.clone();
        supervisor.spawn(&name, feed.run(shutdown));
        Ok(())
    }

    fn latest(&self, pair: &str) -> Option<VenueQuote> {
        self.board.latest(pair)
    }
}
