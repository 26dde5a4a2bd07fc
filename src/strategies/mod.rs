//! Strategy-signal contract and registry.
//!
//! A strategy turns a chunk of price paths into per-step position signals.
//! Signals align to the step axis: the signal at step `t` drives the
//! transition from step `t` to `t + 1`, so a signal row has one fewer
//! column than a path row. Strategies are discovered by `(name, kind)`
//! through a registry populated at startup and frozen thereafter; each
//! implementation declares its parameter schema so configs can be validated
//! before instantiation.

pub mod dual_sma;
pub mod momentum_call;
pub mod sizing;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::core::{EngineError, Result, StrategyKind};
use crate::pricing::ResolvedOptionSpec;

/// Scalar state features handed to strategies.
pub type Features = BTreeMap<String, f64>;

/// One declared parameter of a strategy.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

/// Strategy selection plus free-form parameters, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub name: String,
    pub kind: StrategyKind,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// A dense block of path rows handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct PathChunk<'a> {
    /// Global index of the first row in this chunk.
    pub start_row: usize,
    pub rows: usize,
    pub n_steps: usize,
    /// Row-major values, `n_steps + 1` per row.
    pub data: &'a [f64],
}

impl<'a> PathChunk<'a> {
    pub fn row(&self, local: usize) -> &'a [f64] {
        let w = self.n_steps + 1;
        &self.data[local * w..(local + 1) * w]
    }
}

/// Signals for one chunk of paths.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySignals {
    pub rows: usize,
    pub n_steps: usize,
    /// Stock position per (row, step); shares when sized, else -1/0/+1.
    pub stock: Vec<i32>,
    /// Option position per (row, step); contracts when sized, else 0/+1.
    pub option: Vec<i32>,
    pub features_used: BTreeSet<String>,
}

impl StrategySignals {
    pub fn flat(rows: usize, n_steps: usize) -> Self {
        Self {
            rows,
            n_steps,
            stock: vec![0; rows * n_steps],
            option: vec![0; rows * n_steps],
            features_used: BTreeSet::new(),
        }
    }

    pub fn stock_row(&self, local: usize) -> &[i32] {
        &self.stock[local * self.n_steps..(local + 1) * self.n_steps]
    }

    pub fn option_row(&self, local: usize) -> &[i32] {
        &self.option[local * self.n_steps..(local + 1) * self.n_steps]
    }

    /// Shape check against the chunk the signals were generated from.
    pub fn validate_shape(&self, chunk: &PathChunk<'_>) -> Result<()> {
        if self.rows != chunk.rows || self.n_steps != chunk.n_steps {
            return Err(EngineError::Config(format!(
                "signals: shape ({}, {}) does not match paths chunk ({}, {})",
                self.rows, self.n_steps, chunk.rows, chunk.n_steps
            )));
        }
        if self.stock.len() != self.rows * self.n_steps
            || self.option.len() != self.rows * self.n_steps
        {
            return Err(EngineError::Config(
                "signals: backing arrays do not match the declared shape".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-path position snapshot offered to the early-exercise hook.
#[derive(Debug, Clone, Copy)]
pub struct PositionState {
    pub step: usize,
    pub spot: f64,
    pub premium: f64,
    pub intrinsic: f64,
    pub position: i32,
}

/// Signal-generation contract.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;
    fn param_schema(&self) -> &'static [ParamSpec];

    fn required_features(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_features(&self) -> &'static [&'static str] {
        &[]
    }

    fn generate_signals(
        &self,
        chunk: &PathChunk<'_>,
        features: &Features,
        params: &BTreeMap<String, f64>,
        option_spec: Option<&ResolvedOptionSpec>,
    ) -> Result<StrategySignals>;

    /// Early-exercise assertion; the engine realizes intrinsic value and
    /// flattens the position when this returns true.
    fn check_early_exercise(&self, _state: &PositionState) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name()).finish()
    }
}

type Factory = fn() -> Box<dyn Strategy>;

fn registry() -> &'static BTreeMap<(String, StrategyKind), Factory> {
    static REGISTRY: OnceLock<BTreeMap<(String, StrategyKind), Factory>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<(String, StrategyKind), Factory> = BTreeMap::new();
        map.insert(
            ("dual_sma".to_string(), StrategyKind::Stock),
            || Box::new(dual_sma::DualSma),
        );
        map.insert(
            ("momentum_call".to_string(), StrategyKind::Option),
            || Box::new(momentum_call::MomentumCall),
        );
        map
    })
}

/// Instantiates a registered strategy.
pub fn get_strategy(name: &str, kind: StrategyKind) -> Result<Box<dyn Strategy>> {
    registry()
        .get(&(name.to_string(), kind))
        .map(|factory| factory())
        .ok_or_else(|| {
            let known: Vec<String> = registry()
                .keys()
                .map(|(n, k)| format!("{n}/{}", k.as_str()))
                .collect();
            EngineError::Config(format!(
                "strategy: '{name}' ({}) not registered; known: {}",
                kind.as_str(),
                known.join(", ")
            ))
        })
}

/// Registered strategy names for one kind.
pub fn registered_names(kind: StrategyKind) -> Vec<String> {
    registry()
        .keys()
        .filter(|(_, k)| *k == kind)
        .map(|(n, _)| n.clone())
        .collect()
}

/// Resolves configured parameters against the strategy's schema.
///
/// Unknown keys are rejected, missing keys take declared defaults, and
/// every value is bound-checked.
pub fn resolve_params(
    strategy: &dyn Strategy,
    configured: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>> {
    let schema = strategy.param_schema();
    for key in configured.keys() {
        if !schema.iter().any(|p| p.name == key) {
            return Err(EngineError::Config(format!(
                "strategy_params.{key}: unknown parameter for {}; declared: {}",
                strategy.name(),
                schema
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
    }

    let mut resolved = BTreeMap::new();
    for spec in schema {
        let value = configured.get(spec.name).copied().unwrap_or(spec.default);
        if !value.is_finite() || value < spec.min || value > spec.max {
            return Err(EngineError::Config(format!(
                "strategy_params.{}: {value}; must lie in [{}, {}]",
                spec.name, spec.min, spec.max
            )));
        }
        resolved.insert(spec.name.to_string(), value);
    }
    Ok(resolved)
}

/// Checks declared features against what the run can supply.
pub fn check_features(strategy: &dyn Strategy, features: &Features) -> Result<()> {
    for name in strategy.required_features() {
        if !features.contains_key(*name) {
            return Err(EngineError::MissingFeature(format!(
                "feature '{name}' required by {} is not present; \
                 add it to the feature set or pick another strategy",
                strategy.name()
            )));
        }
    }
    for name in strategy.optional_features() {
        if !features.contains_key(*name) {
            tracing::warn!(
                strategy = strategy.name(),
                feature = name,
                "optional feature missing; using default behavior"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_builtins() {
        assert!(get_strategy("dual_sma", StrategyKind::Stock).is_ok());
        assert!(get_strategy("momentum_call", StrategyKind::Option).is_ok());
        let err = get_strategy("dual_sma", StrategyKind::Option).unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn unknown_params_are_rejected() {
        let strategy = get_strategy("dual_sma", StrategyKind::Stock).unwrap();
        let mut configured = BTreeMap::new();
        configured.insert("bogus".to_string(), 1.0);
        let err = resolve_params(strategy.as_ref(), &configured).unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn defaults_fill_missing_params() {
        let strategy = get_strategy("dual_sma", StrategyKind::Stock).unwrap();
        let resolved = resolve_params(strategy.as_ref(), &BTreeMap::new()).unwrap();
        assert_eq!(resolved["short_window"], 10.0);
        assert_eq!(resolved["long_window"], 30.0);
    }
}
