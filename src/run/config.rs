//! Run configuration and precedence resolution.
//!
//! The effective config is assembled from four layers with fixed
//! precedence: CLI overrides > environment (`TAILSIM_*`) > config file
//! (YAML or JSON) > built-in defaults. The source of every top-level field
//! is tracked and lands in run metadata next to the resolved values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::conditional::ConditionalMethod;
use crate::core::{EngineError, Result, StrategyKind};
use crate::data::{DataSourceSpec, Interval};
use crate::metrics::{CostModel, CovarianceEstimator, VarMethod};
use crate::models::ModelKind;
use crate::pricing::OptionSpec;
use crate::screen::SelectorSpec;
use crate::strategies::StrategyParams;

/// Prefix for environment-variable overrides. Nested fields use `__`,
/// e.g. `TAILSIM_RESOURCE_LIMITS__MAX_WORKERS=2`.
pub const ENV_PREFIX: &str = "TAILSIM_";

/// One grid cell: overrides applied on top of the frozen base config.
///
/// Any field left empty inherits from the base; an empty entry replays the
/// base compare unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GridEntry {
    #[serde(default)]
    pub strategy: Option<StrategyParams>,
    #[serde(default)]
    pub distribution: Option<ModelKind>,
    #[serde(default)]
    pub distribution_params: Option<BTreeMap<String, f64>>,
}

/// Machine-resource limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub mem_ceiling_bytes: Option<u64>,
    /// Permit path matrices at or beyond half the memory budget by
    /// persisting them as run artifacts.
    #[serde(default)]
    pub persistent: bool,
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub symbol: String,
    /// Additional symbols for screening; defaults to just `symbol`.
    pub universe: Vec<String>,
    pub interval: Interval,
    pub data_source: DataSourceSpec,
    pub distribution: ModelKind,
    /// Explicit distribution parameters; set, the family is constructed
    /// directly instead of fit from the data.
    pub distribution_params: Option<BTreeMap<String, f64>>,
    pub n_paths: usize,
    pub n_steps: usize,
    pub seed: u64,
    pub allow_transform: bool,
    pub fallback_to_default: bool,
    pub stock_strategy: Option<StrategyParams>,
    pub option_strategy: Option<StrategyParams>,
    pub option_spec: Option<OptionSpec>,
    /// Contract-chain volatility quote injected by the data collaborator.
    pub provider_iv: Option<f64>,
    pub pricer: String,
    pub selector: Option<SelectorSpec>,
    pub top_n: Option<usize>,
    pub conditional_method: ConditionalMethod,
    pub target_state: BTreeMap<String, f64>,
    pub grid: Option<Vec<GridEntry>>,
    pub resource_limits: ResourceLimits,
    pub costs: CostModel,
    pub var_method: VarMethod,
    pub covariance_estimator: CovarianceEstimator,
    pub risk_free_rate: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            symbol: "SPY".to_string(),
            universe: Vec::new(),
            interval: Interval::Daily,
            data_source: DataSourceSpec::Synthetic {
                s0: 100.0,
                n_bars: 500,
                drift: 0.0,
                volatility: 0.02,
                seed: 7,
            },
            distribution: ModelKind::Laplace,
            distribution_params: None,
            n_paths: 1000,
            n_steps: 60,
            seed: 42,
            allow_transform: false,
            fallback_to_default: false,
            stock_strategy: Some(StrategyParams {
                name: "dual_sma".to_string(),
                kind: StrategyKind::Stock,
                params: BTreeMap::new(),
            }),
            option_strategy: None,
            option_spec: None,
            provider_iv: None,
            pricer: "black_scholes".to_string(),
            selector: None,
            top_n: None,
            conditional_method: ConditionalMethod::Bootstrap,
            target_state: BTreeMap::new(),
            grid: None,
            resource_limits: ResourceLimits::default(),
            costs: CostModel::default(),
            var_method: VarMethod::Historical,
            covariance_estimator: CovarianceEstimator::Sample,
            risk_free_rate: 0.0,
        }
    }
}

impl RunConfig {
    /// Symbols the screen command iterates over.
    pub fn screen_universe(&self) -> Vec<String> {
        if self.universe.is_empty() {
            vec![self.symbol.clone()]
        } else {
            self.universe.clone()
        }
    }

    /// Fail-fast validation of field values and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::Config(
                "symbol: empty; supply a ticker symbol".to_string(),
            ));
        }
        if self.n_paths == 0 {
            return Err(EngineError::Config(
                "n_paths: 0; at least one path is required".to_string(),
            ));
        }
        if self.n_steps == 0 {
            return Err(EngineError::Config(
                "n_steps: 0; at least one step is required".to_string(),
            ));
        }

        if let Some(stock) = &self.stock_strategy {
            if stock.kind != StrategyKind::Stock {
                return Err(EngineError::Config(format!(
                    "stock_strategy.kind: {}; must be stock",
                    stock.kind.as_str()
                )));
            }
        }
        if let Some(option) = &self.option_strategy {
            if option.kind != StrategyKind::Option {
                return Err(EngineError::Config(format!(
                    "option_strategy.kind: {}; must be option",
                    option.kind.as_str()
                )));
            }
            if self.option_spec.is_none() {
                return Err(EngineError::Config(
                    "option_spec: missing while option_strategy is set; \
                     an option strategy needs contract terms"
                        .to_string(),
                ));
            }
        }
        if self.stock_strategy.is_none() && self.option_strategy.is_none() {
            return Err(EngineError::Config(
                "stock_strategy/option_strategy: both missing; nothing to evaluate".to_string(),
            ));
        }

        if let Some(grid) = &self.grid {
            if grid.is_empty() {
                return Err(EngineError::Config(
                    "grid: empty list; a grid needs at least one parameter set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Resolved config plus provenance.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RunConfig,
    /// The resolved config as a JSON value, embedded in metadata.
    pub effective: Value,
    /// Precedence source per top-level field.
    pub sources: BTreeMap<String, String>,
}

/// Assembles the effective configuration with full precedence tracking.
pub fn load_config(
    file: Option<&Path>,
    cli_overrides: &BTreeMap<String, String>,
) -> Result<LoadedConfig> {
    let mut effective = serde_json::to_value(RunConfig::default())?;
    let mut sources: BTreeMap<String, String> = match &effective {
        Value::Object(map) => map
            .keys()
            .map(|k| (k.clone(), "default".to_string()))
            .collect(),
        _ => BTreeMap::new(),
    };

    if let Some(path) = file {
        let file_value = parse_config_file(path)?;
        let Value::Object(ref overlay) = file_value else {
            return Err(EngineError::Config(format!(
                "{}: top level must be a mapping",
                path.display()
            )));
        };
        for key in overlay.keys() {
            sources.insert(key.clone(), "file".to_string());
        }
        deep_merge(&mut effective, &file_value);
    }

    for (key, raw) in std::env::vars() {
        let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = stripped
            .to_lowercase()
            .split("__")
            .map(str::to_string)
            .collect();
        if path.is_empty() || !known_top_level(&effective, &path[0]) {
            continue;
        }
        set_path(&mut effective, &path, parse_scalar(&raw));
        sources.insert(path[0].clone(), "env".to_string());
        tracing::info!(field = %stripped.to_lowercase(), "config override from environment");
    }

    for (dotted, raw) in cli_overrides {
        let path: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if path.is_empty() || path[0].is_empty() {
            return Err(EngineError::Config(format!(
                "override '{dotted}': empty field path"
            )));
        }
        if !known_top_level(&effective, &path[0]) {
            return Err(EngineError::Config(format!(
                "override '{dotted}': unknown field '{}'",
                path[0]
            )));
        }
        set_path(&mut effective, &path, parse_scalar(raw));
        sources.insert(path[0].clone(), "cli".to_string());
        tracing::info!(field = %dotted, "config override from command line");
    }

    let config: RunConfig = serde_json::from_value(effective.clone()).map_err(|e| {
        EngineError::Config(format!("effective config failed to parse: {e}"))
    })?;
    config.validate()?;

    Ok(LoadedConfig {
        config,
        effective,
        sources,
    })
}

fn parse_config_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "json" => serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display()))),
        "yml" | "yaml" => serde_yaml::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display()))),
        other => Err(EngineError::Config(format!(
            "{}: extension '{other}'; config files must be .json, .yml, or .yaml",
            path.display()
        ))),
    }
}

fn known_top_level(effective: &Value, key: &str) -> bool {
    effective
        .as_object()
        .map(|m| m.contains_key(key))
        .unwrap_or(false)
}

/// Scalars are parsed as JSON when possible, falling back to strings, so
/// `n_paths=2000` becomes a number and `symbol=NVDA` a string.
fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        return;
    }
    let mut node = root;
    for key in &path[..path.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        node = node
            .as_object_mut()
            .expect("just ensured object")
            .entry(key.clone())
            .or_insert(Value::Object(serde_json::Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    node.as_object_mut()
        .expect("just ensured object")
        .insert(path[path.len() - 1].clone(), value);
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}
