//! Dual moving-average stock strategy.
//!
//! Long one unit while the short-window mean of the path sits above the
//! long-window mean, short one unit otherwise. Both windows look only at
//! prices up to and including the current step. When a sizing target is
//! configured the unit position scales to the share count that aims for the
//! target daily P&L.

use std::collections::BTreeMap;

use super::sizing::shares_for_target;
use super::{Features, ParamSpec, PathChunk, Strategy, StrategySignals};
use crate::core::{Result, StrategyKind};
use crate::pricing::ResolvedOptionSpec;

const SCHEMA: &[ParamSpec] = &[
    ParamSpec {
        name: "short_window",
        default: 10.0,
        min: 1.0,
        max: 500.0,
    },
    ParamSpec {
        name: "long_window",
        default: 30.0,
        min: 2.0,
        max: 1000.0,
    },
    ParamSpec {
        name: "target_profit_usd",
        default: 0.0,
        min: 0.0,
        max: 1.0e7,
    },
    ParamSpec {
        name: "max_position_usd",
        default: 0.0,
        min: 0.0,
        max: 1.0e9,
    },
];

/// Crossover of two trailing means.
pub struct DualSma;

impl Strategy for DualSma {
    fn name(&self) -> &'static str {
        "dual_sma"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Stock
    }

    fn param_schema(&self) -> &'static [ParamSpec] {
        SCHEMA
    }

    fn optional_features(&self) -> &'static [&'static str] {
        &["expected_daily_move"]
    }

    fn generate_signals(
        &self,
        chunk: &PathChunk<'_>,
        features: &Features,
        params: &BTreeMap<String, f64>,
        _option_spec: Option<&ResolvedOptionSpec>,
    ) -> Result<StrategySignals> {
        let mut short_w = params["short_window"] as usize;
        let mut long_w = params["long_window"] as usize;
        if short_w >= long_w {
            // Degenerate crossover; widen the slow leg.
            long_w = short_w + 5;
        }
        let width = chunk.n_steps + 1;
        short_w = short_w.min(width);
        long_w = long_w.min(width);

        let target_profit = params["target_profit_usd"];
        let max_position = params["max_position_usd"];
        let expected_move = features.get("expected_daily_move").copied().unwrap_or(0.02);

        let mut signals = StrategySignals::flat(chunk.rows, chunk.n_steps);
        let mut prefix = vec![0.0; width + 1];
        for local in 0..chunk.rows {
            let prices = chunk.row(local);
            prefix[0] = 0.0;
            for (i, &p) in prices.iter().enumerate() {
                prefix[i + 1] = prefix[i] + p;
            }
            let trailing_mean = |t: usize, w: usize| {
                let lo = (t + 1).saturating_sub(w);
                (prefix[t + 1] - prefix[lo]) / (t + 1 - lo) as f64
            };

            let size = if target_profit > 0.0 {
                shares_for_target(
                    prices[0],
                    target_profit,
                    expected_move,
                    (max_position > 0.0).then_some(max_position),
                )
            } else {
                1
            };

            let row = &mut signals.stock[local * chunk.n_steps..(local + 1) * chunk.n_steps];
            for (t, slot) in row.iter_mut().enumerate() {
                let fast = trailing_mean(t, short_w);
                let slow = trailing_mean(t, long_w);
                *slot = if fast > slow { size } else { -size };
            }
        }
        if features.contains_key("expected_daily_move") && target_profit > 0.0 {
            signals
                .features_used
                .insert("expected_daily_move".to_string());
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::resolve_params;

    fn chunk_from(rows: usize, n_steps: usize, data: &[f64]) -> PathChunk<'_> {
        PathChunk {
            start_row: 0,
            rows,
            n_steps,
            data,
        }
    }

    #[test]
    fn uptrend_goes_long_downtrend_goes_short() {
        let up: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let down: Vec<f64> = (0..40).map(|i| 100.0 - 0.5 * i as f64).collect();
        let data: Vec<f64> = up.into_iter().chain(down).collect();
        let chunk = chunk_from(2, 39, &data);

        let strategy = DualSma;
        let params = resolve_params(&strategy, &BTreeMap::new()).unwrap();
        let signals = strategy
            .generate_signals(&chunk, &Features::new(), &params, None)
            .unwrap();

        // Late steps of a monotone trend are unambiguous.
        assert_eq!(signals.stock_row(0)[35], 1);
        assert_eq!(signals.stock_row(1)[35], -1);
    }

    #[test]
    fn sizing_scales_the_unit_position() {
        let data: Vec<f64> = (0..30).map(|i| 50.0 + i as f64).collect();
        let chunk = chunk_from(1, 29, &data);

        let strategy = DualSma;
        let mut configured = BTreeMap::new();
        configured.insert("target_profit_usd".to_string(), 500.0);
        let params = resolve_params(&strategy, &configured).unwrap();
        let signals = strategy
            .generate_signals(&chunk, &Features::new(), &params, None)
            .unwrap();

        // 500 / (50 * 0.02) = 500 shares.
        assert_eq!(signals.stock_row(0)[25], 500);
    }
}
