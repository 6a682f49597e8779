//! Core value objects shared between the feeds, the engine and the logger.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One price reading from one venue for one pair. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueQuote {
    pub venue: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Timestamp attached to a price row handed to the logger.
///
/// Feeders always produce full UTC instants. The `Clock` variant carries a
/// bare `HH:MM:SS` wall-clock string (the format the terminal monitor prints)
/// and is reconstructed with today's UTC date at the point of ingest.
#[derive(Debug, Clone)]
pub enum QuoteStamp {
    Utc(DateTime<Utc>),
    Clock(String),
}

impl QuoteStamp {
    /// Resolve to a full UTC instant. `Clock` strings that do not parse as
    /// `HH:MM:SS` fall back to the current instant.
    pub fn normalize(&self) -> DateTime<Utc> {
        match self {
            QuoteStamp::Utc(ts) => *ts,
            QuoteStamp::Clock(raw) => match NaiveTime::parse_from_str(raw, "%H:%M:%S") {
                Ok(t) => Utc::now()
                    .date_naive()
                    .and_time(t)
                    .and_utc(),
                Err(_) => Utc::now(),
            },
        }
    }
}

/// A price row on its way to `exchange_prices`.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub venue: String,
    pub price: f64,
    pub stamp: QuoteStamp,
}

impl From<&VenueQuote> for PricePoint {
    fn from(q: &VenueQuote) -> Self {
        Self {
            venue: q.venue.clone(),
            price: q.price,
            stamp: QuoteStamp::Utc(q.observed_at),
        }
    }
}

/// The virtual long/short pair held between entry and exit detection.
/// At most one exists per pair; never mutated after creation.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub pair: String,
    pub entry_time: DateTime<Utc>,
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub entry_spread_pct: f64,
    pub entry_units: f64,
    pub entry_eff_buy: f64,
    pub entry_eff_sell: f64,
    pub fee_frac: f64,
    pub slip_frac: f64,
}

/// A detected entry moment, destined for `arbitrage_opportunities` plus the
/// snapshot quotes that produced it.
#[derive(Debug, Clone)]
pub struct OpportunityEvent {
    pub pair: String,
    pub buy_venue: String,
    pub buy_price: f64,
    pub sell_venue: String,
    pub sell_price: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub snapshot: Vec<PricePoint>,
}

/// A completed paper trade, destined for `trade_log`.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub timestamp: DateTime<Utc>,
    pub pair: String,
    pub buy_venue: String,
    pub buy_price: f64,
    pub sell_venue: String,
    pub sell_price: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub net_profit: f64,
    pub gross_profit: f64,
    pub event_type: String,
    pub close_timestamp: Option<DateTime<Utc>>,
    pub exit_buy_price: Option<f64>,
    pub exit_sell_price: Option<f64>,
    pub duration_seconds: Option<i32>,
    pub decision_reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn clock_stamp_uses_todays_utc_date() {
        let stamp = QuoteStamp::Clock("12:34:56".to_string());
        let ts = stamp.normalize();
        assert_eq!(ts.date_naive(), Utc::now().date_naive());
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (12, 34, 56));
    }

    #[test]
    fn malformed_clock_stamp_falls_back_to_now() {
        let before = Utc::now();
        let ts = QuoteStamp::Clock("not-a-time".to_string()).normalize();
        assert!(ts >= before);
    }

    #[test]
    fn utc_stamp_is_passed_through() {
        let now = Utc::now();
        let ts = QuoteStamp::Utc(now).normalize();
        assert_eq!(ts, now);
    }
}
