//! Position sizing toward a daily P&L target.
//!
//! Sizing inverts a linear price-change expectation: for an average one-day
//! move of `expected_move_pct`, `shares ~ target / (price * move)`. A
//! notional cap clamps the result.

use crate::core::tuning::CONTRACT_MULTIPLIER;

/// Whole shares targeting `target_profit_usd` per expected daily move.
pub fn shares_for_target(
    price: f64,
    target_profit_usd: f64,
    expected_move_pct: f64,
    max_position_usd: Option<f64>,
) -> i32 {
    if price <= 0.0 || expected_move_pct <= 0.0 || target_profit_usd <= 0.0 {
        return 0;
    }
    let expected_move = price * expected_move_pct;
    let mut shares = (target_profit_usd / expected_move).floor();
    if let Some(cap) = max_position_usd.filter(|c| *c > 0.0) {
        shares = shares.min((cap / price).floor());
    }
    shares.max(0.0) as i32
}

/// Whole contracts targeting `target_profit_usd`, assuming a fixed delta.
///
/// `pnl ~ contracts * 100 * delta * price * move`, inverted for contracts.
pub fn contracts_for_target(
    price: f64,
    target_profit_usd: f64,
    expected_move_pct: f64,
    assumed_delta: f64,
    max_position_usd: Option<f64>,
) -> i32 {
    if price <= 0.0 || expected_move_pct <= 0.0 || target_profit_usd <= 0.0 || assumed_delta <= 0.0
    {
        return 0;
    }
    let denom = CONTRACT_MULTIPLIER * assumed_delta * price * expected_move_pct;
    let mut contracts = (target_profit_usd / denom).floor();
    if let Some(cap) = max_position_usd.filter(|c| *c > 0.0) {
        // Approximate premium for an at-the-money contract with weeks to run.
        let approx_premium = price * 0.5 * CONTRACT_MULTIPLIER;
        contracts = contracts.min((cap / approx_premium).floor());
    }
    contracts.max(0.0) as i32
}
