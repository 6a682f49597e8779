//! Paper-trade simulation math.
//!
//! Pure functions; the engine owns all state. Fees and slippage are applied
//! symmetrically to both legs as fractions of price. The exit netting keeps
//! the forward/reverse decomposition of the market-neutral pairs trade:
//! the forward leg closes the short against the entry effective buy, the
//! reverse leg unwinds the long against the entry effective sell. Both
//! results can legitimately be negative.

use anyhow::{ensure, Result};

use crate::models::OpenPosition;

/// Entry-side quantities carried on an open position.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySim {
    pub units: f64,
    pub eff_buy: f64,
    pub eff_sell: f64,
    pub fee_frac: f64,
    pub slip_frac: f64,
}

/// Exit-side result, rounded to 4 decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSim {
    pub net_profit: f64,
    pub gross_profit: f64,
}

/// Simulate opening the pairs trade: buy `notional` worth on the cheap
/// venue at `buy_price`, short the same units on the expensive venue at
/// `sell_price`. No cash flow is recorded at entry.
pub fn simulate_entry(
    buy_price: f64,
    sell_price: f64,
    notional: f64,
    fee_pct: f64,
    slip_pct: f64,
) -> Result<EntrySim> {
    ensure!(
        buy_price > 0.0 && sell_price > 0.0,
        "entry prices must be positive (buy {buy_price}, sell {sell_price})"
    );
    ensure!(notional > 0.0, "trade notional must be positive, got {notional}");

    let fee_frac = fee_pct / 100.0;
    let slip_frac = slip_pct / 100.0;

    let eff_buy = buy_price * (1.0 + fee_frac + slip_frac);
    let eff_sell = sell_price * (1.0 - fee_frac - slip_frac);
    let units = notional / eff_buy;

    Ok(EntrySim {
        units,
        eff_buy,
        eff_sell,
        fee_frac,
        slip_frac,
    })
}

/// Simulate closing `position` at the current prices on its two venues.
pub fn simulate_exit(
    position: &OpenPosition,
    close_buy_price: f64,
    close_sell_price: f64,
) -> Result<ExitSim> {
    ensure!(
        close_buy_price > 0.0 && close_sell_price > 0.0,
        "exit prices must be positive (buy {close_buy_price}, sell {close_sell_price})"
    );

    let cost = position.fee_frac + position.slip_frac;
    let close_eff_buy = close_buy_price * (1.0 + cost);
    let close_eff_sell = close_sell_price * (1.0 - cost);

    let forward = position.entry_units * (close_eff_sell - position.entry_eff_buy);
    let reverse = position.entry_units * (close_eff_buy - position.entry_eff_sell);

    let net_profit = forward - reverse;
    let gross_profit = (close_sell_price - position.buy_price) * position.entry_units;

    Ok(ExitSim {
        net_profit: round4(net_profit),
        gross_profit: round4(gross_profit),
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
