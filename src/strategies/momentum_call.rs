//! Momentum-gated long-call strategy.
//!
//! Holds the call while the last step return is non-negative, flat
//! otherwise. The engine rejects this strategy without a resolved option
//! contract.

use std::collections::BTreeMap;

use super::sizing::contracts_for_target;
use super::{Features, ParamSpec, PathChunk, Strategy, StrategySignals};
use crate::core::{EngineError, Result, StrategyKind};
use crate::pricing::ResolvedOptionSpec;

const SCHEMA: &[ParamSpec] = &[
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

pub struct MomentumCall;

impl Strategy for MomentumCall {
    fn name(&self) -> &'static str {
        "momentum_call"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Option
    }

    fn param_schema(&self) -> &'static [ParamSpec] {
        SCHEMA
    }

    fn generate_signals(
        &self,
        chunk: &PathChunk<'_>,
        _features: &Features,
        params: &BTreeMap<String, f64>,
        option_spec: Option<&ResolvedOptionSpec>,
    ) -> Result<StrategySignals> {
        let spec = option_spec.ok_or_else(|| {
            EngineError::Config(
                "option_spec: missing; momentum_call trades contracts and needs one".to_string(),
            )
        })?;

        let target_profit = params["target_profit_usd"];
        let max_position = params["max_position_usd"];

        let mut signals = StrategySignals::flat(chunk.rows, chunk.n_steps);
        for local in 0..chunk.rows {
            let prices = chunk.row(local);
            let size = if target_profit > 0.0 {
                contracts_for_target(
                    prices[0],
                    target_profit,
                    0.02,
                    0.5,
                    (max_position > 0.0).then_some(max_position),
                )
            } else {
                spec.contracts as i32
            };

            let row = &mut signals.option[local * chunk.n_steps..(local + 1) * chunk.n_steps];
            for (t, slot) in row.iter_mut().enumerate() {
                let momentum_up = t == 0 || prices[t] >= prices[t - 1];
                *slot = if momentum_up { size } else { 0 };
            }
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OptionType;
    use crate::pricing::IvSource;
    use crate::strategies::resolve_params;

    fn spec() -> ResolvedOptionSpec {
        ResolvedOptionSpec {
            option_type: OptionType::Call,
            strike: 100.0,
            maturity_days: 30,
            iv: 0.3,
            iv_source: IvSource::Default,
            risk_free_rate: 0.04,
            contracts: 2,
            tick_size: 0.5,
        }
    }

    #[test]
    fn requires_an_option_spec() {
        let data = vec![100.0, 101.0, 102.0];
        let chunk = PathChunk {
            start_row: 0,
            rows: 1,
            n_steps: 2,
            data: &data,
        };
        let params = resolve_params(&MomentumCall, &BTreeMap::new()).unwrap();
        let err = MomentumCall
            .generate_signals(&chunk, &Features::new(), &params, None)
            .unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn holds_through_up_moves_only() {
        let data = vec![100.0, 101.0, 99.0, 100.0];
        let chunk = PathChunk {
            start_row: 0,
            rows: 1,
            n_steps: 3,
            data: &data,
        };
        let params = resolve_params(&MomentumCall, &BTreeMap::new()).unwrap();
        let spec = spec();
        let signals = MomentumCall
            .generate_signals(&chunk, &Features::new(), &params, Some(&spec))
            .unwrap();
        assert_eq!(signals.option_row(0), &[2, 2, 0]);
    }
}
