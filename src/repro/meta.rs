//! The run-metadata envelope.
//!
//! A [`RunMetadata`] record is the reproducibility contract of a run: the
//! resolved config with precedence annotations, the fit record, storage
//! and hash of the generated paths, the data fingerprint, environment and
//! code-version capture, and the tunables in force. It is written
//! atomically at run closure (or on abort, flagged incomplete) and never
//! modified afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::conditional::ConditioningReport;
use crate::core::tuning::TuningSnapshot;
use crate::core::{CompletionStatus, Result, StorageTag};
use crate::models::FitRecord;
use crate::repro::artifacts::{persist_json_with_hash, sha256_hex, PersistedArtifact};
use crate::repro::drift::DriftReport;
use crate::repro::environment::{CodeVersion, EnvironmentInfo};
use crate::repro::fingerprint::{DataFingerprint, ReturnsSummary};

/// Current metadata schema version.
pub const META_SCHEMA_VERSION: u32 = 1;

/// File name of the envelope inside a run directory.
pub const META_FILE: &str = "run_meta.json";

/// Bankruptcy accounting surfaced in metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BankruptcySummary {
    pub rate: f64,
    /// First-crossing step -> path count.
    pub first_crossing_histogram: BTreeMap<usize, usize>,
}

/// Reproducibility envelope for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub schema_version: u32,
    pub command: String,
    pub created_at: DateTime<Utc>,
    /// Fully resolved effective config.
    pub config: serde_json::Value,
    /// Precedence source per top-level config field
    /// (`cli`, `env`, `file`, or `default`).
    pub config_sources: BTreeMap<String, String>,
    pub seed: u64,
    #[serde(default)]
    pub fit_record: Option<FitRecord>,
    /// Set when the orchestrator substituted a fallback family.
    #[serde(default)]
    pub fallback_model_used: Option<String>,
    #[serde(default)]
    pub path_storage: Option<StorageTag>,
    #[serde(default)]
    pub paths_hash: Option<String>,
    #[serde(default)]
    pub bankruptcy: Option<BankruptcySummary>,
    #[serde(default)]
    pub data_fingerprint: Option<DataFingerprint>,
    #[serde(default)]
    pub returns_summary: Option<ReturnsSummary>,
    #[serde(default)]
    pub iv_source: Option<String>,
    #[serde(default)]
    pub conditioning: Option<ConditioningReport>,
    #[serde(default)]
    pub drift_report: Option<DriftReport>,
    pub environment: EnvironmentInfo,
    #[serde(default)]
    pub code_version: Option<CodeVersion>,
    #[serde(default)]
    pub code_version_id: Option<String>,
    pub tuning: TuningSnapshot,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    pub completion_status: CompletionStatus,
    #[serde(default)]
    pub error_tag: Option<String>,
}

impl RunMetadata {
    /// Fresh envelope with environment capture; stages fill in the rest.
    pub fn begin(
        command: &str,
        config: serde_json::Value,
        config_sources: BTreeMap<String, String>,
        seed: u64,
    ) -> Self {
        let created_at = Utc::now();
        let code_version = CodeVersion::detect();
        let code_version_id = code_version.as_ref().map(CodeVersion::identifier);
        Self {
            run_id: make_run_id(command, &config, seed, created_at),
            schema_version: META_SCHEMA_VERSION,
            command: command.to_string(),
            created_at,
            config,
            config_sources,
            seed,
            fit_record: None,
            fallback_model_used: None,
            path_storage: None,
            paths_hash: None,
            bankruptcy: None,
            data_fingerprint: None,
            returns_summary: None,
            iv_source: None,
            conditioning: None,
            drift_report: None,
            environment: EnvironmentInfo::capture(),
            code_version,
            code_version_id,
            tuning: TuningSnapshot::current(),
            artifact_paths: Vec::new(),
            completion_status: CompletionStatus::Incomplete,
            error_tag: None,
        }
    }

    /// Writes `run_meta.json` and its hash sidecar atomically.
    pub fn write(&self, run_dir: &Path) -> Result<PersistedArtifact> {
        persist_json_with_hash(&run_dir.join(META_FILE), self)
    }

    /// Loads a previously written envelope.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Deterministic-prefix run identifier:
/// `{command}_{utc stamp}_{content hash of config and seed}`.
pub fn make_run_id(
    command: &str,
    config: &serde_json::Value,
    seed: u64,
    created_at: DateTime<Utc>,
) -> String {
    let payload = format!("{command}|{seed}|{config}");
    let digest = sha256_hex(payload.as_bytes());
    format!(
        "{command}_{}_{}",
        created_at.format("%Y%m%dT%H%M%S"),
        &digest[..12]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn envelope_round_trips_through_disk() {
        let mut meta = RunMetadata::begin(
            "compare",
            serde_json::json!({"n_paths": 100, "seed": 42}),
            BTreeMap::from([("n_paths".to_string(), "file".to_string())]),
            42,
        );
        meta.completion_status = CompletionStatus::Complete;
        meta.paths_hash = Some("abc".to_string());

        let dir = tempdir().unwrap();
        let artifact = meta.write(dir.path()).unwrap();
        assert!(artifact.path.ends_with(META_FILE));

        let loaded = RunMetadata::load(&artifact.path).unwrap();
        assert_eq!(loaded.run_id, meta.run_id);
        assert_eq!(loaded.seed, 42);
        assert_eq!(loaded.paths_hash.as_deref(), Some("abc"));
        assert_eq!(loaded.completion_status, CompletionStatus::Complete);
    }

    #[test]
    fn run_ids_bind_command_config_and_seed() {
        let at = Utc::now();
        let config = serde_json::json!({"a": 1});
        let a = make_run_id("compare", &config, 1, at);
        let b = make_run_id("compare", &config, 1, at);
        let c = make_run_id("compare", &config, 2, at);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("compare_"));
    }
}
