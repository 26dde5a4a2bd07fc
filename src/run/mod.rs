//! Run orchestration.
//!
//! A run binds a resolved [`RunConfig`] and walks a fixed stage DAG:
//! validate config, load and check data, fingerprint, fit (or load) the
//! distribution, pick the storage policy, generate paths, run strategies,
//! compute metrics, and close with an atomically written metadata
//! envelope. Any stage may abort with a structured error; aborted runs
//! leave partial artifacts behind a metadata record flagged incomplete.

pub mod config;
pub mod grid;
pub mod limits;
pub mod simulator;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::conditional::{conditional_paths, ConditioningReport};
use crate::core::tuning::{
    BUDGET_COMPARE_SECS, BUDGET_SCREEN_PER_SYMBOL_SECS,
};
use crate::core::{CompletionStatus, EngineError, Result};
use crate::data::{load_bars, DataBars, DataSourceSpec};
use crate::mc::{
    available_ram_per_worker, decide_storage, generate, PathSettings, PricePaths, StorageDecision,
};
use crate::metrics::{write_metrics_csv, write_metrics_json, MetricsReport};
use crate::models::{fit, from_params, FitOptions, ReturnDistribution};
use crate::pricing::{get_pricer, resolve_option_spec};
use crate::repro::{
    classify_drift, derive_seed, fingerprint_bars, persist_json_with_hash, BankruptcySummary,
    ReturnsSummary, RunMetadata,
};
use crate::screen::{get_selector, screen_universe, ScreenReport, SelectorSpec};
use crate::strategies::{get_strategy, resolve_params, Features};
use self::config::{LoadedConfig, RunConfig};
use self::limits::StageClock;
use self::simulator::{evaluate, EvaluationPlan, StrategyLeg};

pub use self::config::load_config;
pub use self::grid::{run_grid, FailedConfig, GridOutcome, RankedConfig};

/// Result of one completed (or warned) run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub metrics: Option<MetricsReport>,
    pub metadata: RunMetadata,
}

/// Stock-versus-option comparison over one symbol.
pub fn run_compare(loaded: &LoadedConfig, base_dir: &Path) -> Result<RunOutcome> {
    let cfg = &loaded.config;
    let mut meta = RunMetadata::begin(
        "compare",
        loaded.effective.clone(),
        loaded.sources.clone(),
        cfg.seed,
    );
    let run_dir = base_dir.join("runs").join(&meta.run_id);
    std::fs::create_dir_all(&run_dir)?;
    let clock = StageClock::new(BUDGET_COMPARE_SECS);

    match compare_pipeline(cfg, cfg.seed, 1, &run_dir, &mut meta, &clock) {
        Ok(metrics) => finish_run(meta, run_dir, metrics),
        Err(err) => Err(abort_run(meta, &run_dir, err)),
    }
}

/// Universe screening: selectors only, no simulation.
pub fn run_screen(loaded: &LoadedConfig, base_dir: &Path) -> Result<RunOutcome> {
    let cfg = &loaded.config;
    let mut meta = RunMetadata::begin(
        "screen",
        loaded.effective.clone(),
        loaded.sources.clone(),
        cfg.seed,
    );
    let run_dir = base_dir.join("runs").join(&meta.run_id);
    std::fs::create_dir_all(&run_dir)?;

    match screen_pipeline(cfg, &mut meta, &run_dir) {
        Ok(report) => {
            let artifact = persist_json_with_hash(&run_dir.join("screen.json"), &report)?;
            meta.artifact_paths.push(display_name(&artifact.path));
            meta.completion_status = if report.sparse {
                CompletionStatus::Warn
            } else {
                CompletionStatus::Complete
            };
            meta.write(&run_dir)?;
            Ok(RunOutcome {
                run_id: meta.run_id.clone(),
                run_dir,
                metrics: None,
                metadata: meta,
            })
        }
        Err(err) => Err(abort_run(meta, &run_dir, err)),
    }
}

/// Conditional Monte Carlo: screen for episodes, condition the sampler,
/// then evaluate strategies as in compare.
pub fn run_conditional(loaded: &LoadedConfig, base_dir: &Path) -> Result<RunOutcome> {
    let cfg = &loaded.config;
    let mut meta = RunMetadata::begin(
        "conditional",
        loaded.effective.clone(),
        loaded.sources.clone(),
        cfg.seed,
    );
    let run_dir = base_dir.join("runs").join(&meta.run_id);
    std::fs::create_dir_all(&run_dir)?;
    let clock = StageClock::new(BUDGET_COMPARE_SECS);

    match conditional_pipeline(cfg, &run_dir, &mut meta, &clock) {
        Ok(metrics) => finish_run(meta, run_dir, metrics),
        Err(err) => Err(abort_run(meta, &run_dir, err)),
    }
}

/// Replays a prior run from its metadata against current data.
///
/// Drift between the recorded fingerprint and current data aborts the
/// replay unless `allow_drift` downgrades the findings to warnings. Paths
/// are reloaded bit-wise when persisted, otherwise regenerated from the
/// recorded seed and verified against the recorded hash.
pub fn run_replay(meta_path: &Path, base_dir: &Path, allow_drift: bool) -> Result<RunOutcome> {
    let prior = RunMetadata::load(meta_path)?;
    let cfg: RunConfig = serde_json::from_value(prior.config.clone()).map_err(|e| {
        EngineError::Config(format!("recorded config failed to parse: {e}"))
    })?;
    cfg.validate()?;

    let mut meta = RunMetadata::begin(
        "replay",
        prior.config.clone(),
        prior.config_sources.clone(),
        prior.seed,
    );
    let run_dir = base_dir.join("runs").join(&meta.run_id);
    std::fs::create_dir_all(&run_dir)?;
    let clock = StageClock::new(BUDGET_COMPARE_SECS);

    match replay_pipeline(&prior, &cfg, meta_path, &run_dir, &mut meta, allow_drift, &clock) {
        Ok(metrics) => finish_run(meta, run_dir, metrics),
        Err(err) => Err(abort_run(meta, &run_dir, err)),
    }
}

/// The compare stage DAG, shared by the compare command and grid workers
/// (which pass their derived per-config seed and pool size).
pub(crate) fn compare_pipeline(
    cfg: &RunConfig,
    seed: u64,
    workers: usize,
    run_dir: &Path,
    meta: &mut RunMetadata,
    clock: &StageClock,
) -> Result<MetricsReport> {
    let bars = load_bars(&cfg.symbol, cfg.interval, &cfg.data_source)?;
    clock.checkpoint("load_data")?;

    let returns = bars.log_returns();
    meta.data_fingerprint = Some(fingerprint_bars(&bars));
    meta.returns_summary = Some(ReturnsSummary::from_returns(&returns));
    clock.checkpoint("fingerprint")?;

    let dist = resolve_distribution(cfg, &returns, seed, meta)?;
    meta.fit_record = Some(dist.record().clone());
    clock.checkpoint("fit")?;

    let decision = storage_decision(cfg, workers)?;
    meta.path_storage = Some(decision.tag);
    clock.checkpoint("storage_policy")?;

    let settings = PathSettings {
        s0: bars.last_close(),
        n_paths: cfg.n_paths,
        n_steps: cfg.n_steps,
        seed,
    };
    let paths = generate(&dist, &settings, &decision, Some(run_dir))?;
    meta.paths_hash = Some(paths.content_hash()?);
    meta.bankruptcy = Some(BankruptcySummary {
        rate: paths.bankruptcies().rate(cfg.n_paths),
        first_crossing_histogram: paths.bankruptcies().step_histogram(),
    });
    let warned = paths.enforce_bankruptcy_policy()?;
    clock.checkpoint("generate_paths")?;

    let metrics = evaluate_with_config(cfg, &bars, &paths, decision.chunk_rows, meta)?;
    clock.checkpoint("metrics")?;

    paths.cleanup()?;
    meta.completion_status = if warned {
        CompletionStatus::Warn
    } else {
        CompletionStatus::Complete
    };
    Ok(metrics)
}

fn screen_pipeline(
    cfg: &RunConfig,
    meta: &mut RunMetadata,
    _run_dir: &Path,
) -> Result<ScreenReport> {
    let selector_spec = cfg.selector.clone().unwrap_or(SelectorSpec {
        name: "gap_volume".to_string(),
        params: BTreeMap::new(),
    });
    let selector = get_selector(&selector_spec)?;

    let symbols = cfg.screen_universe();
    let mut universe = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let clock = StageClock::new(BUDGET_SCREEN_PER_SYMBOL_SECS);
        let source = per_symbol_source(&cfg.data_source, symbol);
        let bars = load_bars(symbol, cfg.interval, &source)?;
        if let Some(first) = universe.first() {
            check_screen_schema(first, &bars)?;
        }
        clock.checkpoint("screen_symbol")?;
        universe.push(bars);
    }

    let report = screen_universe(&universe, selector.as_ref(), cfg.top_n)?;
    meta.data_fingerprint = universe.first().map(fingerprint_bars);
    Ok(report)
}

fn conditional_pipeline(
    cfg: &RunConfig,
    run_dir: &Path,
    meta: &mut RunMetadata,
    clock: &StageClock,
) -> Result<MetricsReport> {
    let bars = load_bars(&cfg.symbol, cfg.interval, &cfg.data_source)?;
    clock.checkpoint("load_data")?;

    let returns = bars.log_returns();
    meta.data_fingerprint = Some(fingerprint_bars(&bars));
    meta.returns_summary = Some(ReturnsSummary::from_returns(&returns));

    let selector_spec = cfg.selector.clone().unwrap_or(SelectorSpec {
        name: "gap_volume".to_string(),
        params: BTreeMap::new(),
    });
    let selector = get_selector(&selector_spec)?;
    let episodes = selector.select(&bars)?;
    clock.checkpoint("select_episodes")?;

    let decision = storage_decision(cfg, 1)?;
    meta.path_storage = Some(decision.tag);

    let fit_opts = FitOptions {
        allow_transform: cfg.allow_transform,
        fallback_to_default: cfg.fallback_to_default,
        ..FitOptions::default()
    };
    let settings = PathSettings {
        s0: bars.last_close(),
        n_paths: cfg.n_paths,
        n_steps: cfg.n_steps,
        seed: cfg.seed,
    };
    let (paths, conditioning): (PricePaths, ConditioningReport) = conditional_paths(
        &bars,
        &episodes,
        &cfg.target_state,
        cfg.conditional_method,
        cfg.distribution,
        &fit_opts,
        &settings,
        &decision,
        Some(run_dir),
    )?;
    meta.conditioning = Some(conditioning);
    meta.paths_hash = Some(paths.content_hash()?);
    meta.bankruptcy = Some(BankruptcySummary {
        rate: paths.bankruptcies().rate(cfg.n_paths),
        first_crossing_histogram: paths.bankruptcies().step_histogram(),
    });
    let warned = paths.enforce_bankruptcy_policy()?;
    clock.checkpoint("generate_paths")?;

    let metrics = evaluate_with_config(cfg, &bars, &paths, decision.chunk_rows, meta)?;
    clock.checkpoint("metrics")?;

    paths.cleanup()?;
    meta.completion_status = if warned {
        CompletionStatus::Warn
    } else {
        CompletionStatus::Complete
    };
    Ok(metrics)
}

#[allow(clippy::too_many_arguments)]
fn replay_pipeline(
    prior: &RunMetadata,
    cfg: &RunConfig,
    meta_path: &Path,
    run_dir: &Path,
    meta: &mut RunMetadata,
    allow_drift: bool,
    clock: &StageClock,
) -> Result<MetricsReport> {
    let bars = load_bars(&cfg.symbol, cfg.interval, &cfg.data_source)?;
    let current_fp = fingerprint_bars(&bars);
    let returns = bars.log_returns();
    let current_rs = ReturnsSummary::from_returns(&returns);
    clock.checkpoint("load_data")?;

    let recorded_fp = prior.data_fingerprint.as_ref().ok_or_else(|| {
        EngineError::Data(
            "prior run_meta.json has no data fingerprint; it cannot anchor a replay".to_string(),
        )
    })?;
    let recorded_rs = prior.returns_summary.unwrap_or(ReturnsSummary {
        mean: 0.0,
        std: 0.0,
        count: 0,
    });

    let mut drift = classify_drift(recorded_fp, &current_fp, &recorded_rs, &current_rs);
    if drift.has_fatal() {
        if allow_drift {
            drift.overridden = true;
            for finding in &drift.findings {
                tracing::warn!(
                    class = finding.class.as_str(),
                    detail = %finding.detail,
                    "drift downgraded to warning by override"
                );
            }
        } else {
            let fatal = drift.first_fatal().expect("has_fatal checked");
            let err = EngineError::Drift(fatal.class, fatal.detail.clone());
            meta.drift_report = Some(drift);
            return Err(err);
        }
    }
    let data_unchanged = drift.is_clean();
    meta.drift_report = Some(drift);
    meta.data_fingerprint = Some(current_fp);
    meta.returns_summary = Some(current_rs);
    clock.checkpoint("drift_check")?;

    let recorded_hash = prior.paths_hash.as_deref().ok_or_else(|| {
        EngineError::Data("prior run_meta.json has no paths hash to verify against".to_string())
    })?;

    let prior_dir = meta_path.parent().unwrap_or(Path::new("."));
    let persisted_bin = prior_dir.join("paths.bin");
    let decision = storage_decision(cfg, 1)?;

    let paths = if persisted_bin.exists() {
        let loaded = PricePaths::open(&persisted_bin)?;
        if loaded.content_hash()? != recorded_hash {
            return Err(EngineError::Data(format!(
                "paths.bin: content hash differs from the recorded {recorded_hash}; \
                 the artifact does not belong to this run"
            )));
        }
        loaded
    } else {
        let dist = resolve_distribution(cfg, &returns, prior.seed, meta)?;
        meta.fit_record = Some(dist.record().clone());
        let settings = PathSettings {
            s0: bars.last_close(),
            n_paths: cfg.n_paths,
            n_steps: cfg.n_steps,
            seed: prior.seed,
        };
        let regenerated = generate(&dist, &settings, &decision, Some(run_dir))?;
        let hash = regenerated.content_hash()?;
        if hash != recorded_hash {
            // Drifted data necessarily regenerates different paths; the
            // hash only binds when the fingerprint still matches.
            if data_unchanged {
                return Err(EngineError::Data(format!(
                    "regenerated paths hash {hash} differs from recorded {recorded_hash} \
                     on unchanged data; the code or numeric stack changed"
                )));
            }
            tracing::warn!(
                recorded = recorded_hash,
                regenerated = %hash,
                "paths regenerated over drifted data; hash verification waived"
            );
        }
        regenerated
    };
    meta.path_storage = Some(paths.storage_tag());
    meta.paths_hash = Some(paths.content_hash()?);
    meta.bankruptcy = prior.bankruptcy.clone();
    clock.checkpoint("paths")?;

    let metrics = evaluate_with_config(cfg, &bars, &paths, decision.chunk_rows, meta)?;
    clock.checkpoint("metrics")?;

    paths.cleanup()?;
    meta.completion_status = CompletionStatus::Complete;
    Ok(metrics)
}

/// Resolves strategies and the option contract, then evaluates.
pub(crate) fn evaluate_with_config(
    cfg: &RunConfig,
    bars: &DataBars,
    paths: &PricePaths,
    chunk_rows: usize,
    meta: &mut RunMetadata,
) -> Result<MetricsReport> {
    let pricer = get_pricer(&cfg.pricer)?;

    let stock = match &cfg.stock_strategy {
        Some(spec) => {
            let strategy = get_strategy(&spec.name, spec.kind)?;
            let params = resolve_params(strategy.as_ref(), &spec.params)?;
            Some((strategy, params))
        }
        None => None,
    };

    let option = match (&cfg.option_strategy, &cfg.option_spec) {
        (Some(spec), Some(contract)) => {
            let strategy = get_strategy(&spec.name, spec.kind)?;
            let params = resolve_params(strategy.as_ref(), &spec.params)?;
            let resolved = resolve_option_spec(
                contract,
                paths.settings().s0,
                Some(bars),
                cfg.provider_iv,
            )?;
            meta.iv_source = Some(resolved.iv_source.as_str().to_string());
            Some((strategy, params, resolved))
        }
        _ => None,
    };

    let plan = EvaluationPlan {
        stock: stock.as_ref().map(|(strategy, params)| StrategyLeg {
            strategy: strategy.as_ref(),
            params: params.clone(),
        }),
        option: option.as_ref().map(|(strategy, params, resolved)| {
            (
                StrategyLeg {
                    strategy: strategy.as_ref(),
                    params: params.clone(),
                },
                *resolved,
            )
        }),
        pricer: pricer.as_ref(),
        features: Features::new(),
        costs: cfg.costs,
        var_method: cfg.var_method,
        covariance_estimator: cfg.covariance_estimator,
        risk_free_annual: cfg.risk_free_rate,
        chunk_rows,
    };
    evaluate(paths, &plan)
}

/// Storage decision for a run sharing the machine with `workers` peers.
///
/// A standalone run owns the whole budget (`workers = 1`); grid workers
/// split it across the pool.
pub(crate) fn storage_decision(cfg: &RunConfig, workers: usize) -> Result<StorageDecision> {
    let budget = available_ram_per_worker(cfg.resource_limits.mem_ceiling_bytes, workers);
    decide_storage(
        cfg.n_paths,
        cfg.n_steps,
        budget,
        cfg.resource_limits.persistent,
    )
}

/// Fits the configured family, or constructs it directly when explicit
/// parameters are pinned in the config.
fn resolve_distribution(
    cfg: &RunConfig,
    returns: &[f64],
    seed: u64,
    meta: &mut RunMetadata,
) -> Result<ReturnDistribution> {
    if let Some(params) = &cfg.distribution_params {
        return from_params(cfg.distribution, params, seed);
    }
    let fit_opts = FitOptions {
        allow_transform: cfg.allow_transform,
        fallback_to_default: cfg.fallback_to_default,
        ..FitOptions::default()
    };
    let dist = fit(cfg.distribution, returns, seed, &fit_opts)?;
    if dist.record().fallback_from.is_some() {
        meta.fallback_model_used = Some(dist.kind().as_str().to_string());
        tracing::warn!(
            run_id = %meta.run_id,
            model = dist.kind().as_str(),
            "fit fell back to the default family"
        );
    }
    Ok(dist)
}

/// Synthetic universes give each symbol its own derived stream so the
/// screen sees distinct histories from one configured source.
fn per_symbol_source(source: &DataSourceSpec, symbol: &str) -> DataSourceSpec {
    match source {
        DataSourceSpec::Synthetic {
            s0,
            n_bars,
            drift,
            volatility,
            seed,
        } => DataSourceSpec::Synthetic {
            s0: *s0,
            n_bars: *n_bars,
            drift: *drift,
            volatility: *volatility,
            seed: derive_seed(*seed, symbol),
        },
        other => other.clone(),
    }
}

fn check_screen_schema(reference: &DataBars, candidate: &DataBars) -> Result<()> {
    if reference.interval() != candidate.interval() {
        return Err(EngineError::Data(format!(
            "interval: {} for {} differs from {} in the same universe",
            candidate.interval().as_str(),
            candidate.symbol(),
            reference.interval().as_str()
        )));
    }
    Ok(())
}

fn finish_run(
    mut meta: RunMetadata,
    run_dir: PathBuf,
    metrics: MetricsReport,
) -> Result<RunOutcome> {
    let json_path = run_dir.join("metrics.json");
    let csv_path = run_dir.join("metrics.csv");
    write_metrics_json(&metrics, &json_path)?;
    write_metrics_csv(&metrics, &csv_path)?;
    meta.artifact_paths.push(display_name(&json_path));
    meta.artifact_paths.push(display_name(&csv_path));
    if run_dir.join("paths.bin").exists() {
        meta.artifact_paths.push("paths.bin".to_string());
    }
    meta.write(&run_dir)?;
    tracing::info!(run_id = %meta.run_id, status = meta.completion_status.as_str(), "run closed");
    Ok(RunOutcome {
        run_id: meta.run_id.clone(),
        run_dir,
        metrics: Some(metrics),
        metadata: meta,
    })
}

fn abort_run(mut meta: RunMetadata, run_dir: &Path, err: EngineError) -> EngineError {
    meta.completion_status = CompletionStatus::Incomplete;
    meta.error_tag = Some(err.tag());
    if let Err(write_err) = meta.write(run_dir) {
        tracing::error!(error = %write_err, "failed to persist partial metadata");
    }
    tracing::error!(
        run_id = %meta.run_id,
        tag = %err.tag(),
        error = %err,
        "run aborted"
    );
    err
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact")
        .to_string()
}
