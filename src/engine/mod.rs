//! Per-pair arbitrage state machine.
//!
//! One engine covers every configured pair. Each tick it snapshots the
//! matrix, persists the observed prices, and walks the two-state machine:
//! `IDLE -> OPEN` when both spread thresholds are met, `OPEN -> IDLE` when
//! the spread converges and both entry venues are still quoting. A fault
//! evaluating one pair aborts only that pair's tick; the sink is buffered
//! and can never block a decision.

pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::{
    ABS_SPREAD_THRESHOLD, CONVERGENCE_THRESHOLD, FEE_PCT, PCT_SPREAD_THRESHOLD, SLIPPAGE_PCT,
    TICK_INTERVAL, TRADE_NOTIONAL,
};
use crate::db::TradeSink;
use crate::matrix::MarketMatrix;
use crate::models::{OpenPosition, OpportunityEvent, PricePoint, TradeEvent, VenueQuote};

/// Closed-trade count between running-total log lines.
const SUMMARY_EVERY: u64 = 5;

pub struct ArbitrageEngine {
    matrix: Arc<MarketMatrix>,
    sink: Arc<dyn TradeSink>,
    positions: HashMap<String, OpenPosition>,
    closed_trades: u64,
    realized_net: f64,
}

impl ArbitrageEngine {
    pub fn new(matrix: Arc<MarketMatrix>, sink: Arc<dyn TradeSink>) -> Self {
        Self {
            matrix,
            sink,
            positions: HashMap::new(),
            closed_trades: 0,
            realized_net: 0.0,
        }
    }

    /// Tick loop; runs until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            pairs = self.matrix.pairs().len(),
            "arbitrage engine started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
        info!(
            closed_trades = self.closed_trades,
            realized_net = self.realized_net,
            "arbitrage engine stopped"
        );
    }

    fn tick(&mut self) {
        let pairs: Vec<String> = self.matrix.pairs().to_vec();
        for pair in pairs {
            if let Err(e) = self.evaluate_pair(&pair) {
                error!(pair = %pair, error = %e, "tick aborted for pair");
            }
        }
    }

    fn evaluate_pair(&mut self, pair: &str) -> Result<()> {
        let snapshot = self.matrix.snapshot(pair);
        if snapshot.len() < 2 {
            return Ok(());
        }

        self.sink
            .log_prices(pair, snapshot.iter().map(PricePoint::from).collect());

        let (low, high) = extremes(&snapshot);
        let spread = high.price - low.price;
        let spread_pct = spread / low.price * 100.0;

        if !self.positions.contains_key(pair) {
            if spread >= ABS_SPREAD_THRESHOLD && spread_pct >= PCT_SPREAD_THRESHOLD {
                self.open_position(pair, low, high, spread, spread_pct, &snapshot)?;
            }
        } else if spread_pct <= CONVERGENCE_THRESHOLD {
            self.close_position(pair, &snapshot)?;
        }
        Ok(())
    }

    fn open_position(
        &mut self,
        pair: &str,
        low: &VenueQuote,
        high: &VenueQuote,
        spread: f64,
        spread_pct: f64,
        snapshot: &[VenueQuote],
    ) -> Result<()> {
        let entry = sim::simulate_entry(low.price, high.price, TRADE_NOTIONAL, FEE_PCT, SLIPPAGE_PCT)?;

        info!(
            pair = %pair,
            buy_venue = %low.venue,
            buy_price = low.price,
            sell_venue = %high.venue,
            sell_price = high.price,
            spread_pct,
            "ENTRY: long {} / short {}", low.venue, high.venue
        );

        self.sink.log_opportunity(OpportunityEvent {
            pair: pair.to_string(),
            buy_venue: low.venue.clone(),
            buy_price: low.price,
            sell_venue: high.venue.clone(),
            sell_price: high.price,
            spread,
            spread_pct,
            snapshot: snapshot.iter().map(PricePoint::from).collect(),
        });

        self.positions.insert(
            pair.to_string(),
            OpenPosition {
                pair: pair.to_string(),
                entry_time: Utc::now(),
                buy_venue: low.venue.clone(),
                sell_venue: high.venue.clone(),
                buy_price: low.price,
                sell_price: high.price,
                entry_spread_pct: spread_pct,
                entry_units: entry.units,
                entry_eff_buy: entry.eff_buy,
                entry_eff_sell: entry.eff_sell,
                fee_frac: entry.fee_frac,
                slip_frac: entry.slip_frac,
            },
        );
        Ok(())
    }

    fn close_position(&mut self, pair: &str, snapshot: &[VenueQuote]) -> Result<()> {
        let Some(position) = self.positions.get(pair).cloned() else {
            return Ok(());
        };

        let price_on = |venue: &str| {
            snapshot
                .iter()
                .find(|q| q.venue == venue)
                .map(|q| q.price)
        };
        let (Some(exit_buy), Some(exit_sell)) =
            (price_on(&position.buy_venue), price_on(&position.sell_venue))
        else {
            debug!(pair = %pair, "entry venue missing from snapshot; holding position");
            return Ok(());
        };

        let exit = sim::simulate_exit(&position, exit_buy, exit_sell)?;
        let now = Utc::now();
        let duration_seconds = (now - position.entry_time).num_seconds().max(0) as i32;

        info!(
            pair = %pair,
            net_profit = exit.net_profit,
            gross_profit = exit.gross_profit,
            duration_seconds,
            "EXIT: spread converged"
        );

        self.sink.log_trade(TradeEvent {
            timestamp: position.entry_time,
            pair: pair.to_string(),
            buy_venue: position.buy_venue.clone(),
            buy_price: position.buy_price,
            sell_venue: position.sell_venue.clone(),
            sell_price: position.sell_price,
            spread: position.sell_price - position.buy_price,
            spread_pct: position.entry_spread_pct,
            net_profit: exit.net_profit,
            gross_profit: exit.gross_profit,
            event_type: "EXIT".to_string(),
            close_timestamp: Some(now),
            exit_buy_price: Some(exit_buy),
            exit_sell_price: Some(exit_sell),
            duration_seconds: Some(duration_seconds),
            decision_reason: Some("spread_converged".to_string()),
            metadata: None,
        });

        self.positions.remove(pair);
        self.closed_trades += 1;
        self.realized_net += exit.net_profit;
        if self.closed_trades % SUMMARY_EVERY == 0 {
            info!(
                trades = self.closed_trades,
                total_net_profit = self.realized_net,
                "paper trade summary"
            );
        }
        Ok(())
    }
}

/// Lowest- and highest-priced quotes; the first occurrence wins ties.
fn extremes(snapshot: &[VenueQuote]) -> (&VenueQuote, &VenueQuote) {
    let mut low = &snapshot[0];
    let mut high = &snapshot[0];
    for quote in &snapshot[1..] {
        if quote.price < low.price {
            low = quote;
        }
        if quote.price > high.price {
            high = quote;
        }
    }
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};

    use crate::feeds::PriceFeed;
    use crate::supervisor::Supervisor;

    struct TestFeed {
        venue: &'static str,
        prices: RwLock<HashMap<String, f64>>,
    }

    impl TestFeed {
        fn new(venue: &'static str) -> Arc<Self> {
            Arc::new(Self {
                venue,
                prices: RwLock::new(HashMap::new()),
            })
        }

        fn set(&self, pair: &str, price: f64) {
            self.prices.write().insert(pair.to_string(), price);
        }

        fn clear(&self, pair: &str) {
            self.prices.write().remove(pair);
        }
    }

    #[async_trait]
    impl PriceFeed for TestFeed {
        fn name(&self) -> &'static str {
            self.venue
        }

        async fn connect(self: Arc<Self>, _supervisor: &Supervisor) -> Result<()> {
            Ok(())
        }

        fn latest(&self, pair: &str) -> Option<VenueQuote> {
            self.prices.read().get(pair).map(|price| VenueQuote {
                venue: self.venue.to_string(),
                price: *price,
                observed_at: Utc::now(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        opportunities: Mutex<Vec<OpportunityEvent>>,
        prices: Mutex<Vec<(String, Vec<PricePoint>)>>,
        trades: Mutex<Vec<TradeEvent>>,
    }

    impl TradeSink for RecordingSink {
        fn log_opportunity(&self, event: OpportunityEvent) {
            self.opportunities.lock().push(event);
        }

        fn log_prices(&self, pair: &str, rows: Vec<PricePoint>) {
            self.prices.lock().push((pair.to_string(), rows));
        }

        fn log_trade(&self, event: TradeEvent) {
            self.trades.lock().push(event);
        }
    }

    const PAIR: &str = "X/USDC";

    fn engine_with_two_feeds() -> (ArbitrageEngine, Arc<TestFeed>, Arc<TestFeed>, Arc<RecordingSink>)
    {
        let a = TestFeed::new("A");
        let b = TestFeed::new("B");
        let mut matrix = MarketMatrix::new();
        matrix.add(PAIR, a.clone());
        matrix.add(PAIR, b.clone());
        let sink = Arc::new(RecordingSink::default());
        let engine = ArbitrageEngine::new(Arc::new(matrix), sink.clone());
        (engine, a, b, sink)
    }

    #[test]
    fn entry_opens_a_position_and_logs_the_opportunity() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);

        engine.tick();

        let position = engine.positions.get(PAIR).expect("position open");
        assert_eq!(position.buy_venue, "A");
        assert_eq!(position.sell_venue, "B");
        assert!((position.entry_units - 9.98502).abs() < 1e-5);
        assert!((position.entry_eff_buy - 100.15).abs() < 1e-9);
        assert!((position.entry_eff_sell - 100.4491).abs() < 1e-9);

        let opportunities = sink.opportunities.lock();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].snapshot.len(), 2);
        // Every tick with >= 2 quotes also logs unassociated prices.
        assert_eq!(sink.prices.lock().len(), 1);
    }

    #[test]
    fn exact_thresholds_are_inclusive() {
        let (mut engine, a, b, _sink) = engine_with_two_feeds();
        // spread = 0.05 exactly, spread_pct = 0.40 exactly.
        a.set(PAIR, 12.50);
        b.set(PAIR, 12.55);

        engine.tick();
        assert!(engine.positions.contains_key(PAIR));
    }

    #[test]
    fn no_entry_below_the_absolute_floor() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        // spread_pct = 0.45% but spread = 0.045 < 0.05.
        a.set(PAIR, 10.000);
        b.set(PAIR, 10.045);

        engine.tick();
        assert!(engine.positions.is_empty());
        assert!(sink.opportunities.lock().is_empty());
    }

    #[test]
    fn no_entry_below_the_percent_floor() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        // spread = 0.30 but spread_pct = 0.1%.
        a.set(PAIR, 300.00);
        b.set(PAIR, 300.30);

        engine.tick();
        assert!(engine.positions.is_empty());
        assert!(sink.opportunities.lock().is_empty());
    }

    #[test]
    fn single_venue_pairs_are_skipped_entirely() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.0);
        b.clear(PAIR);

        engine.tick();
        assert!(engine.positions.is_empty());
        assert!(sink.prices.lock().is_empty());
    }

    #[test]
    fn at_most_one_position_per_pair() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);
        engine.tick();
        let entry_time = engine.positions.get(PAIR).unwrap().entry_time;

        // Spread widens further while open; entry is silently ignored.
        b.set(PAIR, 102.00);
        engine.tick();

        assert_eq!(engine.positions.len(), 1);
        assert_eq!(engine.positions.get(PAIR).unwrap().entry_time, entry_time);
        assert_eq!(sink.opportunities.lock().len(), 1);
    }

    #[test]
    fn convergence_closes_the_position_with_a_trade_row() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);
        engine.tick();

        // spread_pct = 0.0498% <= 0.10%.
        a.set(PAIR, 100.30);
        b.set(PAIR, 100.35);
        engine.tick();

        assert!(engine.positions.is_empty());
        let trades = sink.trades.lock();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.event_type, "EXIT");
        assert_eq!(trade.decision_reason.as_deref(), Some("spread_converged"));
        assert_eq!(trade.exit_buy_price, Some(100.30));
        assert_eq!(trade.exit_sell_price, Some(100.35));
        assert!(trade.close_timestamp.is_some());
        assert!(trade.duration_seconds.unwrap() >= 0);
    }

    #[test]
    fn convergence_threshold_is_inclusive() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);
        engine.tick();

        // spread_pct exactly 0.10%.
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.10);
        engine.tick();

        assert!(engine.positions.is_empty());
        assert_eq!(sink.trades.lock().len(), 1);
    }

    #[test]
    fn open_position_survives_while_spread_stays_wide() {
        let (mut engine, a, b, sink) = engine_with_two_feeds();
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);
        engine.tick();

        // Still above convergence.
        a.set(PAIR, 100.00);
        b.set(PAIR, 100.30);
        engine.tick();

        assert!(engine.positions.contains_key(PAIR));
        assert!(sink.trades.lock().is_empty());
    }

    #[test]
    fn missing_entry_venue_defers_the_exit() {
        let a = TestFeed::new("A");
        let b = TestFeed::new("B");
        let c = TestFeed::new("C");
        let mut matrix = MarketMatrix::new();
        matrix.add(PAIR, a.clone());
        matrix.add(PAIR, b.clone());
        matrix.add(PAIR, c.clone());
        let sink = Arc::new(RecordingSink::default());
        let mut engine = ArbitrageEngine::new(Arc::new(matrix), sink.clone());

        a.set(PAIR, 100.00);
        b.set(PAIR, 100.60);
        engine.tick();
        assert!(engine.positions.contains_key(PAIR));

        // Venue A drops out; B and C converge. The position must hold.
        a.clear(PAIR);
        b.set(PAIR, 100.30);
        c.set(PAIR, 100.32);
        engine.tick();

        assert!(engine.positions.contains_key(PAIR));
        assert!(sink.trades.lock().is_empty());

        // A comes back and the pair converges; now the exit lands.
        a.set(PAIR, 100.30);
        b.set(PAIR, 100.35);
        c.set(PAIR, 100.33);
        engine.tick();

        assert!(engine.positions.is_empty());
        assert_eq!(sink.trades.lock().len(), 1);
    }

    #[test]
    fn fault_on_one_pair_leaves_other_pairs_running() {
        let a = TestFeed::new("A");
        let b = TestFeed::new("B");
        let mut matrix = MarketMatrix::new();
        matrix.add("BAD/USDC", a.clone());
        matrix.add("BAD/USDC", b.clone());
        matrix.add("GOOD/USDC", a.clone());
        matrix.add("GOOD/USDC", b.clone());
        let sink = Arc::new(RecordingSink::default());
        let mut engine = ArbitrageEngine::new(Arc::new(matrix), sink.clone());

        // The stub can serve a zero price, which the real feed boundary
        // rejects; here it drives the simulator's invariant guard.
        a.set("BAD/USDC", 0.0);
        b.set("BAD/USDC", 1.0);
        a.set("GOOD/USDC", 100.00);
        b.set("GOOD/USDC", 100.60);

        engine.tick();

        assert!(!engine.positions.contains_key("BAD/USDC"));
        assert!(engine.positions.contains_key("GOOD/USDC"));
    }
}
