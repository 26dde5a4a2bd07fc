//! End-to-end command scenarios over the library surface.

use std::collections::BTreeMap;

use tailsim::core::StorageTag;
use tailsim::mc::decide_storage;
use tailsim::repro::RunMetadata;
use tailsim::run::{load_config, run_compare, run_conditional, run_grid, run_replay};

const GIB: u64 = 1024 * 1024 * 1024;

fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn baseline_compare_completes_with_metrics_and_metadata() {
    let cli = overrides(&[
        (
            "stock_strategy",
            r#"{"name":"dual_sma","kind":"stock","params":{"short_window":10,"long_window":30}}"#,
        ),
        ("n_paths", "1000"),
        ("n_steps", "60"),
        ("seed", "42"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let outcome = run_compare(&loaded, dir.path()).unwrap();
    let metrics = outcome.metrics.expect("compare produces metrics");
    assert!(metrics.unconditional.sharpe.is_finite());
    assert_eq!(metrics.unconditional.n_paths, 1000);

    assert!(outcome.run_dir.join("metrics.json").exists());
    assert!(outcome.run_dir.join("metrics.csv").exists());

    let meta = RunMetadata::load(&outcome.run_dir.join("run_meta.json")).unwrap();
    assert_eq!(meta.seed, 42);
    let fit = meta.fit_record.expect("fit record present");
    assert!(fit.aic.is_finite());
    assert_eq!(meta.completion_status.as_str(), "complete");
}

#[test]
fn oversized_footprints_spill_or_reject_by_rule() {
    // 100k x 1000 steps is ~880 MB with the safety factor.
    let spilled = decide_storage(100_000, 1_000, 2 * GIB + GIB / 2, false).unwrap();
    assert_eq!(spilled.tag, StorageTag::Memmap);
    assert!(spilled.chunk_rows < 100_000);

    // Against a 1 GiB budget the same shape crosses the 50% line.
    let rejected = decide_storage(100_000, 1_000, GIB, false).unwrap_err();
    assert_eq!(rejected.tag(), "ResourceLimitError");
    let persisted = decide_storage(100_000, 1_000, GIB, true).unwrap();
    assert_eq!(persisted.tag, StorageTag::Persistent);
}

#[test]
fn memmap_and_memory_runs_agree_on_paths_and_metrics() {
    let base = overrides(&[("n_paths", "500"), ("n_steps", "40"), ("seed", "42")]);
    let loaded_mem = load_config(None, &base).unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let in_memory = run_compare(&loaded_mem, dir_a.path()).unwrap();
    assert_eq!(
        in_memory.metadata.path_storage,
        Some(StorageTag::Memory)
    );

    // A tight ceiling pushes the same shape into the spill band.
    let mut spill = base.clone();
    // 500 x 41 cells * 8 * 1.1 ~ 180 KB; a 500 KB ceiling lands in [25%, 50%).
    spill.insert(
        "resource_limits.mem_ceiling_bytes".to_string(),
        "500000".to_string(),
    );
    let loaded_spill = load_config(None, &spill).unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let spilled = run_compare(&loaded_spill, dir_b.path()).unwrap();
    assert_eq!(spilled.metadata.path_storage, Some(StorageTag::Memmap));

    assert_eq!(in_memory.metadata.paths_hash, spilled.metadata.paths_hash);
    assert_eq!(in_memory.metrics, spilled.metrics);
}

#[test]
fn bankruptcy_cascade_fails_the_run_with_accounting() {
    let cli = overrides(&[
        ("distribution_params", r#"{"loc":-0.5,"scale":0.3}"#),
        ("n_paths", "1000"),
        ("n_steps", "100"),
        ("seed", "42"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let err = run_compare(&loaded, dir.path()).unwrap_err();
    assert_eq!(err.tag(), "NumericError:Bankruptcy");

    // The aborted run still leaves a partial envelope with the rate and
    // first-crossing histogram.
    let runs: Vec<_> = std::fs::read_dir(dir.path().join("runs"))
        .unwrap()
        .collect::<std::io::Result<_>>()
        .unwrap();
    assert_eq!(runs.len(), 1);
    let meta = RunMetadata::load(&runs[0].path().join("run_meta.json")).unwrap();
    assert_eq!(meta.completion_status.as_str(), "incomplete");
    assert_eq!(meta.error_tag.as_deref(), Some("NumericError:Bankruptcy"));
    let bankruptcy = meta.bankruptcy.expect("bankruptcy summary recorded");
    assert!(bankruptcy.rate > 0.5);
    assert!(!bankruptcy.first_crossing_histogram.is_empty());
}

#[test]
fn count_drift_blocks_replay_unless_overridden() {
    let cli = overrides(&[
        (
            "data_source",
            r#"{"kind":"synthetic","s0":100.0,"n_bars":1000,"drift":0.0,"volatility":0.02,"seed":7}"#,
        ),
        ("n_paths", "200"),
        ("n_steps", "30"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let original = run_compare(&loaded, dir.path()).unwrap();
    let meta_path = original.run_dir.join("run_meta.json");

    // Simulate the provider restating history: 20% more rows.
    let mut recorded: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
    recorded["config"]["data_source"]["n_bars"] = serde_json::json!(1200);
    std::fs::write(&meta_path, serde_json::to_string_pretty(&recorded).unwrap()).unwrap();

    let replay_dir = tempfile::tempdir().unwrap();
    let err = run_replay(&meta_path, replay_dir.path(), false).unwrap_err();
    assert_eq!(err.tag(), "DriftError:CountDrift");

    let overridden = run_replay(&meta_path, replay_dir.path(), true).unwrap();
    let drift = overridden
        .metadata
        .drift_report
        .expect("drift recorded under override");
    assert!(drift.overridden);
    assert!(drift
        .findings
        .iter()
        .any(|f| f.class.as_str() == "CountDrift"));
}

#[test]
fn grid_isolates_per_config_failures() {
    let mut grid_entries = Vec::new();
    for short in [4, 5, 6, 7, 8, 9, 11, 12] {
        grid_entries.push(serde_json::json!({
            "strategy": {
                "name": "dual_sma",
                "kind": "stock",
                "params": {"short_window": short, "long_window": 30}
            }
        }));
    }
    // Two cells pin an implausible Student-t.
    for _ in 0..2 {
        grid_entries.push(serde_json::json!({
            "distribution": "student_t",
            "distribution_params": {"loc": 0.0, "scale": 0.02, "df": 1.5}
        }));
    }
    // Distinguish the two bad cells so their content ids differ.
    grid_entries[8]["strategy"] = serde_json::json!({
        "name": "dual_sma", "kind": "stock", "params": {"short_window": 13.0}
    });

    let cli = overrides(&[
        ("grid", &serde_json::json!(grid_entries).to_string()),
        ("n_paths", "200"),
        ("n_steps", "30"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let outcome = run_grid(&loaded, dir.path()).unwrap();
    assert_eq!(outcome.ranking.len(), 8);
    assert_eq!(outcome.failed.len(), 2);
    for failure in &outcome.failed {
        assert_eq!(failure.error_tag, "FitError:ImplausibleParams");
    }
    assert!(!outcome.partial);

    let ranking_text =
        std::fs::read_to_string(outcome.run_dir.join("ranking.json")).unwrap();
    let ranking: serde_json::Value = serde_json::from_str(&ranking_text).unwrap();
    assert_eq!(ranking.as_array().unwrap().len(), 8);
}

#[test]
fn sparse_episode_matches_fall_back_to_unconditional() {
    // A calm synthetic series yields far fewer than min_match episodes.
    let cli = overrides(&[("n_paths", "200"), ("n_steps", "20"), ("seed", "5")]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let outcome = run_conditional(&loaded, dir.path()).unwrap();
    let conditioning = outcome
        .metadata
        .conditioning
        .expect("conditioning report recorded");
    assert!(conditioning.fallback_used);
    assert_eq!(conditioning.method_used, "unconditional");
    assert!(outcome.metrics.is_some());
}
