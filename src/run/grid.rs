//! Grid scheduling: parallel fan-out of `compare` over parameter sets.
//!
//! Each grid entry is identified by a content hash of its parameter set,
//! evaluated by a worker holding a frozen copy of the effective config and
//! a seed derived from `(parent_seed, config_id)`. Workers write their
//! artifacts immediately, so an interrupted grid resumes by skipping
//! completed ids. A per-config failure is recorded with its error tag and
//! never stops the rest of the grid.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::config::{GridEntry, LoadedConfig};
use super::limits::{cancellation_requested, worker_count, StageClock};
use super::{compare_pipeline, display_name};
use crate::core::tuning::{
    BUDGET_COMPARE_SECS, BUDGET_GRID_SECS, OBJECTIVE_EPSILON, OBJECTIVE_WEIGHTS,
};
use crate::core::{CompletionStatus, EngineError, Result, StrategyKind};
use crate::metrics::MetricsReport;
use crate::repro::{config_seed, persist_json_with_hash, short_content_id, RunMetadata};

/// One completed grid entry with its composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedConfig {
    pub config_id: String,
    pub params: GridEntry,
    pub objective_score: f64,
    pub metrics: MetricsReport,
}

/// One failed grid entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedConfig {
    pub config_id: String,
    pub error_tag: String,
    pub message: String,
}

/// Manifest written when a grid drains early.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialManifest {
    pub partial: bool,
    pub completed: Vec<String>,
}

/// Grid-level result.
#[derive(Debug)]
pub struct GridOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// Completed configs, best composite score first.
    pub ranking: Vec<RankedConfig>,
    pub failed: Vec<FailedConfig>,
    /// Configs reused from a prior interrupted grid.
    pub resumed: usize,
    /// True when cancellation drained the grid before completion.
    pub partial: bool,
    pub metadata: RunMetadata,
}

impl GridOutcome {
    /// CLI exit code: 0 for grid-level success (even with failed cells),
    /// 6 when the grid was interrupted and drained early.
    pub fn exit_code(&self) -> i32 {
        if self.partial {
            6
        } else {
            0
        }
    }
}

enum ConfigResult {
    Completed {
        config_id: String,
        params: GridEntry,
        metrics: MetricsReport,
        resumed: bool,
    },
    Failed(FailedConfig),
    Skipped,
}

/// Fans `compare` out over the configured parameter grid.
pub fn run_grid(loaded: &LoadedConfig, base_dir: &Path) -> Result<GridOutcome> {
    let cfg = &loaded.config;
    let entries = cfg.grid.clone().ok_or_else(|| {
        EngineError::Config("grid: missing; the grid command needs a parameter list".to_string())
    })?;

    let mut meta = RunMetadata::begin(
        "grid",
        loaded.effective.clone(),
        loaded.sources.clone(),
        cfg.seed,
    );
    let run_dir = base_dir.join("runs").join(&meta.run_id);
    let configs_dir = run_dir.join("configs");
    std::fs::create_dir_all(&configs_dir)?;
    let clock = StageClock::new(BUDGET_GRID_SECS);

    let identified: Vec<(String, GridEntry)> = entries
        .iter()
        .map(|entry| Ok((short_content_id(entry)?, entry.clone())))
        .collect::<Result<_>>()?;

    let workers = worker_count(cfg.resource_limits.max_workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::Io(format!("worker pool: {e}")))?;
    tracing::info!(configs = identified.len(), workers, "grid dispatch");

    let results: Vec<ConfigResult> = pool.install(|| {
        identified
            .par_iter()
            .map(|(config_id, entry)| run_one_config(cfg, config_id, entry, &configs_dir))
            .collect()
    });
    clock.checkpoint("grid_workers")?;

    let mut completed: Vec<(String, GridEntry, MetricsReport)> = Vec::new();
    let mut failed = Vec::new();
    let mut resumed = 0usize;
    let mut skipped = 0usize;
    for result in results {
        match result {
            ConfigResult::Completed {
                config_id,
                params,
                metrics,
                resumed: was_resumed,
            } => {
                if was_resumed {
                    resumed += 1;
                }
                completed.push((config_id, params, metrics));
            }
            ConfigResult::Failed(failure) => failed.push(failure),
            ConfigResult::Skipped => skipped += 1,
        }
    }

    let ranking = rank_configs(completed);
    let partial = skipped > 0;

    let ranking_artifact = persist_json_with_hash(&run_dir.join("ranking.json"), &ranking)?;
    meta.artifact_paths.push(display_name(&ranking_artifact.path));

    if partial {
        let manifest = PartialManifest {
            partial: true,
            completed: ranking.iter().map(|r| r.config_id.clone()).collect(),
        };
        let artifact = persist_json_with_hash(&run_dir.join("partial_manifest.json"), &manifest)?;
        meta.artifact_paths.push(display_name(&artifact.path));
        tracing::warn!(
            completed = ranking.len(),
            skipped,
            "grid drained early; partial manifest written"
        );
    }

    for failure in &failed {
        tracing::warn!(
            config_id = %failure.config_id,
            tag = %failure.error_tag,
            "grid config failed"
        );
    }

    meta.completion_status = if partial {
        CompletionStatus::Incomplete
    } else if failed.is_empty() {
        CompletionStatus::Complete
    } else {
        CompletionStatus::Warn
    };
    meta.write(&run_dir)?;

    Ok(GridOutcome {
        run_id: meta.run_id.clone(),
        run_dir,
        ranking,
        failed,
        resumed,
        partial,
        metadata: meta,
    })
}

fn run_one_config(
    base_cfg: &super::config::RunConfig,
    config_id: &str,
    entry: &GridEntry,
    configs_dir: &Path,
) -> ConfigResult {
    let config_dir = configs_dir.join(config_id);

    // Resume: a metrics artifact means the config already completed.
    let metrics_path = config_dir.join("metrics.json");
    if metrics_path.exists() {
        match std::fs::read_to_string(&metrics_path)
            .map_err(EngineError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(EngineError::from))
        {
            Ok(metrics) => {
                tracing::info!(config_id, "config already complete; skipping");
                return ConfigResult::Completed {
                    config_id: config_id.to_string(),
                    params: entry.clone(),
                    metrics,
                    resumed: true,
                };
            }
            Err(err) => {
                tracing::warn!(config_id, error = %err, "stale metrics artifact; re-running");
            }
        }
    }

    if cancellation_requested() {
        return ConfigResult::Skipped;
    }

    // Frozen config copy with the cell's overrides applied.
    let mut cfg = base_cfg.clone();
    if let Some(strategy) = &entry.strategy {
        match strategy.kind {
            StrategyKind::Stock => cfg.stock_strategy = Some(strategy.clone()),
            StrategyKind::Option => cfg.option_strategy = Some(strategy.clone()),
        }
    }
    if let Some(distribution) = entry.distribution {
        cfg.distribution = distribution;
    }
    if let Some(dist_params) = &entry.distribution_params {
        cfg.distribution_params = Some(dist_params.clone());
    }
    if let Err(err) = cfg.validate() {
        return ConfigResult::Failed(FailedConfig {
            config_id: config_id.to_string(),
            error_tag: err.tag(),
            message: err.to_string(),
        });
    }

    let seed = config_seed(base_cfg.seed, config_id);
    let mut sub_meta = RunMetadata::begin(
        "grid_config",
        serde_json::to_value(&cfg).unwrap_or_default(),
        Default::default(),
        seed,
    );
    if std::fs::create_dir_all(&config_dir).is_err() {
        return ConfigResult::Failed(FailedConfig {
            config_id: config_id.to_string(),
            error_tag: "IoError".to_string(),
            message: format!("could not create {}", config_dir.display()),
        });
    }

    let clock = StageClock::new(BUDGET_COMPARE_SECS);
    let workers = worker_count(base_cfg.resource_limits.max_workers);
    match compare_pipeline(&cfg, seed, workers, &config_dir, &mut sub_meta, &clock) {
        Ok(metrics) => {
            let json_ok = crate::metrics::write_metrics_json(&metrics, &metrics_path).is_ok();
            let csv_ok =
                crate::metrics::write_metrics_csv(&metrics, &config_dir.join("metrics.csv"))
                    .is_ok();
            sub_meta.artifact_paths.push("metrics.json".to_string());
            sub_meta.artifact_paths.push("metrics.csv".to_string());
            let meta_ok = sub_meta.write(&config_dir).is_ok();
            if !(json_ok && csv_ok && meta_ok) {
                return ConfigResult::Failed(FailedConfig {
                    config_id: config_id.to_string(),
                    error_tag: "IoError".to_string(),
                    message: "failed to persist config artifacts".to_string(),
                });
            }
            ConfigResult::Completed {
                config_id: config_id.to_string(),
                params: entry.clone(),
                metrics,
                resumed: false,
            }
        }
        Err(err) => {
            sub_meta.completion_status = CompletionStatus::Incomplete;
            sub_meta.error_tag = Some(err.tag());
            let _ = sub_meta.write(&config_dir);
            ConfigResult::Failed(FailedConfig {
                config_id: config_id.to_string(),
                error_tag: err.tag(),
                message: err.to_string(),
            })
        }
    }
}

/// Ranks completed configs by the composite objective.
///
/// Each metric is z-scored across completed configs with an epsilon guard,
/// then combined as `w_pnl z(pnl) + w_sharpe z(sharpe) - w_dd z(drawdown)
/// - w_cvar z(cvar)`. A single-config grid scores zero. Ties break on
/// `config_id` for determinism.
fn rank_configs(completed: Vec<(String, GridEntry, MetricsReport)>) -> Vec<RankedConfig> {
    let n = completed.len();
    if n == 0 {
        return Vec::new();
    }

    let pnl: Vec<f64> = completed
        .iter()
        .map(|(_, _, m)| m.unconditional.mean_pnl)
        .collect();
    let sharpe: Vec<f64> = completed
        .iter()
        .map(|(_, _, m)| m.unconditional.sharpe)
        .collect();
    let drawdown: Vec<f64> = completed
        .iter()
        .map(|(_, _, m)| m.unconditional.max_drawdown)
        .collect();
    let cvar: Vec<f64> = completed
        .iter()
        .map(|(_, _, m)| m.unconditional.cvar)
        .collect();

    let z = |values: &[f64], i: usize| -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
            / values.len() as f64;
        (values[i] - mean) / (var.sqrt() + OBJECTIVE_EPSILON)
    };

    let weights = OBJECTIVE_WEIGHTS;
    let mut ranked: Vec<RankedConfig> = completed
        .into_iter()
        .enumerate()
        .map(|(i, (config_id, params, mut metrics))| {
            let score = weights.pnl * z(&pnl, i) + weights.sharpe * z(&sharpe, i)
                - weights.drawdown * z(&drawdown, i)
                - weights.cvar * z(&cvar, i);
            metrics.objective_score = Some(score);
            RankedConfig {
                config_id,
                params,
                objective_score: score,
                metrics,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.objective_score
            .total_cmp(&a.objective_score)
            .then_with(|| a.config_id.cmp(&b.config_id))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::StrategyParams;
    use std::collections::BTreeMap;

    fn metrics_with(pnl: f64, sharpe: f64, dd: f64, cvar: f64) -> MetricsReport {
        use crate::metrics::{CovarianceEstimator, MetricsSummary, VarMethod};
        let summary = MetricsSummary {
            mean_pnl: pnl,
            median_pnl: pnl,
            sharpe,
            sortino: sharpe,
            max_drawdown: dd,
            var: cvar * 0.8,
            cvar,
            n_paths: 10,
        };
        MetricsReport {
            unconditional: summary,
            conditional: summary,
            bankruptcy_rate: 0.0,
            early_exercise_events: 0,
            var_method: VarMethod::Historical,
            covariance_estimator: CovarianceEstimator::Sample,
            n_steps: 10,
            objective_score: None,
        }
    }

    fn params(short: f64) -> GridEntry {
        GridEntry {
            strategy: Some(StrategyParams {
                name: "dual_sma".to_string(),
                kind: StrategyKind::Stock,
                params: BTreeMap::from([("short_window".to_string(), short)]),
            }),
            distribution: None,
            distribution_params: None,
        }
    }

    #[test]
    fn better_configs_rank_first() {
        let completed = vec![
            ("aaa".to_string(), params(5.0), metrics_with(1.0, 0.5, 0.3, 5.0)),
            ("bbb".to_string(), params(10.0), metrics_with(5.0, 1.5, 0.1, 1.0)),
            ("ccc".to_string(), params(15.0), metrics_with(3.0, 1.0, 0.2, 2.0)),
        ];
        let ranked = rank_configs(completed);
        assert_eq!(ranked[0].config_id, "bbb");
        assert_eq!(ranked[2].config_id, "aaa");
        assert!(ranked[0].objective_score > ranked[1].objective_score);
    }

    #[test]
    fn single_config_grid_scores_zero() {
        let completed = vec![(
            "only".to_string(),
            params(5.0),
            metrics_with(2.0, 1.0, 0.1, 1.0),
        )];
        let ranked = rank_configs(completed);
        assert_eq!(ranked.len(), 1);
        assert!(ranked[0].objective_score.abs() < 1.0e-9);
    }

    #[test]
    fn identical_scores_break_ties_lexicographically() {
        let m = metrics_with(1.0, 1.0, 0.1, 1.0);
        let completed = vec![
            ("zzz".to_string(), params(5.0), m.clone()),
            ("aaa".to_string(), params(5.0), m),
        ];
        let ranked = rank_configs(completed);
        assert_eq!(ranked[0].config_id, "aaa");
    }
}
