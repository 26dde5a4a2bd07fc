//! Screening and grid-lifecycle behavior.

use std::collections::BTreeMap;

use tailsim::run::limits::{request_cancellation, reset_cancellation};
use tailsim::run::{load_config, run_grid, run_screen};
use tailsim::screen::ScreenReport;

fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn screen_ranks_episodes_across_a_universe() {
    let cli = overrides(&[
        ("universe", r#"["AAA","BBB","CCC"]"#),
        (
            "data_source",
            r#"{"kind":"synthetic","s0":100.0,"n_bars":400,"drift":0.0,"volatility":0.05,"seed":3}"#,
        ),
        (
            "selector",
            r#"{"name":"gap_volume","params":{"gap_min":0.001,"volume_z_min":0.1}}"#,
        ),
        ("top_n", "25"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let outcome = run_screen(&loaded, dir.path()).unwrap();
    let report_path = outcome.run_dir.join("screen.json");
    assert!(report_path.exists());
    assert!(outcome.run_dir.join("screen.sha256").exists());

    let report: ScreenReport =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report.symbols_screened, 3);
    assert!(report.episodes.len() <= 25);
    for pair in report.episodes.windows(2) {
        assert!(pair[0].score >= pair[1].score, "episodes not sorted by score");
    }
    // Rules only see information before t0.
    for episode in &report.episodes {
        assert!(episode.t0_index >= 21);
    }
}

#[test]
fn cancelled_grid_drains_and_writes_a_partial_manifest() {
    let grid: Vec<serde_json::Value> = [5, 8, 11]
        .iter()
        .map(|short| {
            serde_json::json!({
                "strategy": {
                    "name": "dual_sma",
                    "kind": "stock",
                    "params": {"short_window": short}
                }
            })
        })
        .collect();
    let cli = overrides(&[
        ("grid", &serde_json::json!(grid).to_string()),
        ("n_paths", "100"),
        ("n_steps", "15"),
    ]);
    let loaded = load_config(None, &cli).unwrap();
    let dir = tempfile::tempdir().unwrap();

    request_cancellation();
    let outcome = run_grid(&loaded, dir.path());
    reset_cancellation();

    let outcome = outcome.unwrap();
    assert!(outcome.partial);
    assert!(outcome.ranking.is_empty());
    assert!(outcome.run_dir.join("partial_manifest.json").exists());
    assert_eq!(outcome.metadata.completion_status.as_str(), "incomplete");
}
