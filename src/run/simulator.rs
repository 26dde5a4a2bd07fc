//! Strategy evaluation over generated paths.
//!
//! The simulator streams the path matrix in row chunks, asks each
//! configured strategy leg for its signals, and accumulates realized P&L
//! with transaction costs. Positions follow the signal contract: the
//! signal at step `t` holds over the `t -> t+1` transition, and a trade is
//! booked whenever the position changes at `t`.

use std::collections::BTreeMap;

use crate::core::tuning::CONTRACT_MULTIPLIER;
use crate::core::{OptionType, Result};
use crate::mc::PricePaths;
use crate::metrics::{
    summarize, CostModel, CovarianceEstimator, MetricsReport, VarMethod,
};
use crate::pricing::{price_along_path, OptionPricer, ResolvedOptionSpec};
use crate::strategies::{
    check_features, Features, PathChunk, PositionState, Strategy, StrategySignals,
};

/// One strategy leg with resolved parameters.
pub struct StrategyLeg<'a> {
    pub strategy: &'a dyn Strategy,
    pub params: BTreeMap<String, f64>,
}

/// Everything the simulator needs besides the paths themselves.
pub struct EvaluationPlan<'a> {
    pub stock: Option<StrategyLeg<'a>>,
    pub option: Option<(StrategyLeg<'a>, ResolvedOptionSpec)>,
    pub pricer: &'a dyn OptionPricer,
    pub features: Features,
    pub costs: CostModel,
    pub var_method: VarMethod,
    pub covariance_estimator: CovarianceEstimator,
    pub risk_free_annual: f64,
    pub chunk_rows: usize,
}

fn intrinsic(option_type: OptionType, spot: f64, strike: f64) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Evaluates the plan over every path and computes summary metrics.
pub fn evaluate(paths: &PricePaths, plan: &EvaluationPlan<'_>) -> Result<MetricsReport> {
    let n_paths = paths.n_paths();
    let n_steps = paths.n_steps();
    let width = n_steps + 1;

    if let Some(leg) = &plan.stock {
        check_features(leg.strategy, &plan.features)?;
    }
    if let Some((leg, _)) = &plan.option {
        check_features(leg.strategy, &plan.features)?;
    }

    let mut pnl_all = vec![0.0; n_paths];
    let mut equity_sum = vec![0.0; width];
    let mut equity_sum_ex = vec![0.0; width];
    let mut solvent_paths = 0usize;
    let mut early_events = 0usize;

    paths.for_each_chunk(plan.chunk_rows, |start_row, data| {
        let rows = data.len() / width;
        let chunk = PathChunk {
            start_row,
            rows,
            n_steps,
            data,
        };

        let stock_signals: Option<StrategySignals> = match &plan.stock {
            Some(leg) => {
                let signals =
                    leg.strategy
                        .generate_signals(&chunk, &plan.features, &leg.params, None)?;
                signals.validate_shape(&chunk)?;
                Some(signals)
            }
            None => None,
        };
        let option_signals: Option<StrategySignals> = match &plan.option {
            Some((leg, spec)) => {
                let signals =
                    leg.strategy
                        .generate_signals(&chunk, &plan.features, &leg.params, Some(spec))?;
                signals.validate_shape(&chunk)?;
                Some(signals)
            }
            None => None,
        };

        for local in 0..rows {
            let prices = chunk.row(local);
            let global_row = start_row + local;
            let mut equity = prices[0];
            let mut step_pnl = vec![0.0; n_steps];

            if let Some(signals) = &stock_signals {
                let positions = signals.stock_row(local);
                let mut prev_pos = 0i32;
                for t in 0..n_steps {
                    let pos = positions[t];
                    let mut pnl = pos as f64 * (prices[t + 1] - prices[t]);
                    if pos != prev_pos {
                        pnl -= plan
                            .costs
                            .stock_trade_cost((pos - prev_pos) as f64, prices[t]);
                    }
                    step_pnl[t] += pnl;
                    prev_pos = pos;
                }
            }

            if let Some((leg, spec)) = &plan.option {
                let signals = option_signals.as_ref().expect("generated above");
                let positions = signals.option_row(local);
                let premiums = price_along_path(plan.pricer, prices, spec)?;
                equity += premiums[0] * CONTRACT_MULTIPLIER;

                let mut prev_pos = 0i32;
                let mut exercised = false;
                for t in 0..n_steps {
                    if exercised {
                        break;
                    }
                    let pos = positions[t];
                    let mut pnl = 0.0;
                    if pos != prev_pos {
                        pnl -= plan
                            .costs
                            .option_trade_cost((pos - prev_pos) as f64, premiums[t]);
                    }

                    if pos != 0 {
                        let state = PositionState {
                            step: t,
                            spot: prices[t],
                            premium: premiums[t],
                            intrinsic: intrinsic(spec.option_type, prices[t], spec.strike),
                            position: pos,
                        };
                        if leg.strategy.check_early_exercise(&state) {
                            // Realize intrinsic at this step and flatten.
                            pnl += pos as f64
                                * (state.intrinsic - premiums[t])
                                * CONTRACT_MULTIPLIER;
                            pnl -= plan.costs.option_trade_cost(pos as f64, state.intrinsic);
                            early_events += 1;
                            exercised = true;
                            step_pnl[t] += pnl;
                            prev_pos = 0;
                            continue;
                        }
                    }

                    pnl += pos as f64 * (premiums[t + 1] - premiums[t]) * CONTRACT_MULTIPLIER;
                    step_pnl[t] += pnl;
                    prev_pos = pos;
                }
            }

            let bankrupt = paths.bankruptcies().is_bankrupt(global_row);
            if !bankrupt {
                solvent_paths += 1;
            }

            equity_sum[0] += equity;
            if !bankrupt {
                equity_sum_ex[0] += equity;
            }
            let mut total = 0.0;
            for t in 0..n_steps {
                total += step_pnl[t];
                equity += step_pnl[t];
                equity_sum[t + 1] += equity;
                if !bankrupt {
                    equity_sum_ex[t + 1] += equity;
                }
            }
            pnl_all[global_row] = total;
        }
        Ok(())
    })?;

    let mean_equity: Vec<f64> = equity_sum.iter().map(|s| s / n_paths as f64).collect();
    let unconditional = summarize(
        &pnl_all,
        &mean_equity,
        plan.var_method,
        plan.covariance_estimator,
        plan.risk_free_annual,
    );

    let ledger = paths.bankruptcies();
    let pnl_solvent: Vec<f64> = pnl_all
        .iter()
        .enumerate()
        .filter(|(row, _)| !ledger.is_bankrupt(*row))
        .map(|(_, v)| *v)
        .collect();
    let mean_equity_ex: Vec<f64> = if solvent_paths > 0 {
        equity_sum_ex
            .iter()
            .map(|s| s / solvent_paths as f64)
            .collect()
    } else {
        vec![0.0; width]
    };
    let conditional = summarize(
        &pnl_solvent,
        &mean_equity_ex,
        plan.var_method,
        plan.covariance_estimator,
        plan.risk_free_annual,
    );

    Ok(MetricsReport {
        unconditional,
        conditional,
        bankruptcy_rate: ledger.rate(n_paths),
        early_exercise_events: early_events,
        var_method: plan.var_method,
        covariance_estimator: plan.covariance_estimator,
        n_steps,
        objective_score: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StorageTag, StrategyKind};
    use crate::mc::{generate, PathSettings, StorageDecision};
    use crate::models::laplace::Laplace;
    use crate::models::ReturnDistribution;
    use crate::pricing::{BlackScholesPricer, IvSource};
    use crate::strategies::{get_strategy, resolve_params, ParamSpec};

    fn mem_paths(n_paths: usize, n_steps: usize, loc: f64, scale: f64) -> PricePaths {
        let dist =
            ReturnDistribution::Laplace(Laplace::from_params(loc, scale, 1).unwrap());
        let settings = PathSettings {
            s0: 100.0,
            n_paths,
            n_steps,
            seed: 42,
        };
        let decision = StorageDecision {
            tag: StorageTag::Memory,
            chunk_rows: n_paths,
            footprint: 0,
            budget: 0,
        };
        generate(&dist, &settings, &decision, None).unwrap()
    }

    fn stock_plan<'a>(
        strategy: &'a dyn Strategy,
        params: BTreeMap<String, f64>,
        pricer: &'a BlackScholesPricer,
        chunk_rows: usize,
    ) -> EvaluationPlan<'a> {
        EvaluationPlan {
            stock: Some(StrategyLeg { strategy, params }),
            option: None,
            pricer,
            features: Features::new(),
            costs: CostModel::default(),
            var_method: VarMethod::Historical,
            covariance_estimator: CovarianceEstimator::Sample,
            risk_free_annual: 0.0,
            chunk_rows,
        }
    }

    #[test]
    fn metrics_are_chunking_invariant() {
        let paths = mem_paths(200, 40, 0.0, 0.02);
        let strategy = get_strategy("dual_sma", StrategyKind::Stock).unwrap();
        let params = resolve_params(strategy.as_ref(), &BTreeMap::new()).unwrap();
        let pricer = BlackScholesPricer;

        let big = evaluate(&paths, &stock_plan(strategy.as_ref(), params.clone(), &pricer, 200))
            .unwrap();
        let small =
            evaluate(&paths, &stock_plan(strategy.as_ref(), params, &pricer, 7)).unwrap();
        assert_eq!(big, small);
    }

    #[test]
    fn option_leg_adds_early_exercise_accounting() {
        struct AlwaysExercise;
        impl Strategy for AlwaysExercise {
            fn name(&self) -> &'static str {
                "always_exercise"
            }
            fn kind(&self) -> StrategyKind {
                StrategyKind::Option
            }
            fn param_schema(&self) -> &'static [ParamSpec] {
                &[]
            }
            fn generate_signals(
                &self,
                chunk: &PathChunk<'_>,
                _features: &Features,
                _params: &BTreeMap<String, f64>,
                _spec: Option<&ResolvedOptionSpec>,
            ) -> Result<StrategySignals> {
                let mut s = StrategySignals::flat(chunk.rows, chunk.n_steps);
                s.option.fill(1);
                Ok(s)
            }
            fn check_early_exercise(&self, state: &PositionState) -> bool {
                state.intrinsic > 5.0
            }
        }

        let paths = mem_paths(100, 30, 0.01, 0.03);
        let spec = ResolvedOptionSpec {
            option_type: OptionType::Call,
            strike: 100.0,
            maturity_days: 30,
            iv: 0.3,
            iv_source: IvSource::Default,
            risk_free_rate: 0.02,
            contracts: 1,
            tick_size: 0.5,
        };
        let pricer = BlackScholesPricer;
        let plan = EvaluationPlan {
            stock: None,
            option: Some((
                StrategyLeg {
                    strategy: &AlwaysExercise,
                    params: BTreeMap::new(),
                },
                spec,
            )),
            pricer: &pricer,
            features: Features::new(),
            costs: CostModel::default(),
            var_method: VarMethod::Historical,
            covariance_estimator: CovarianceEstimator::Sample,
            risk_free_annual: 0.0,
            chunk_rows: 100,
        };

        let report = evaluate(&paths, &plan).unwrap();
        // Upward-drifting laplace paths cross the intrinsic trigger often.
        assert!(report.early_exercise_events > 0);
        assert_eq!(report.unconditional.n_paths, 100);
    }

    #[test]
    fn costs_reduce_pnl() {
        let paths = mem_paths(150, 30, 0.0, 0.02);
        let strategy = get_strategy("dual_sma", StrategyKind::Stock).unwrap();
        let params = resolve_params(strategy.as_ref(), &BTreeMap::new()).unwrap();
        let pricer = BlackScholesPricer;

        let mut cheap = stock_plan(strategy.as_ref(), params.clone(), &pricer, 150);
        cheap.costs = CostModel {
            slippage_bps: 0.0,
            fee_per_share: 0.0,
            fee_per_contract: 0.0,
        };
        let free = evaluate(&paths, &cheap).unwrap();

        let mut dear = stock_plan(strategy.as_ref(), params, &pricer, 150);
        dear.costs = CostModel {
            slippage_bps: 50.0,
            fee_per_share: 0.05,
            fee_per_contract: 1.0,
        };
        let costed = evaluate(&paths, &dear).unwrap();

        assert!(costed.unconditional.mean_pnl < free.unconditional.mean_pnl);
    }
}
