//! Host environment and code-version capture.
//!
//! Everything here is best effort: a missing source-control revision
//! degrades to a warning and a null field, never an error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared versions of the numeric stack, pinned at build time.
const NUMERIC_STACK: &[(&str, &str)] = &[
    ("rand", "0.9"),
    ("rand_chacha", "0.9"),
    ("rand_distr", "0.5"),
    ("statrs", "0.18"),
    ("rayon", "1.10"),
];

/// Host snapshot embedded in run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub engine_version: String,
    pub cpu_count: usize,
    pub total_ram_bytes: Option<u64>,
    pub numeric_stack: BTreeMap<String, String>,
}

impl EnvironmentInfo {
    pub fn capture() -> Self {
        Self {
            os_name: std::env::consts::OS.to_string(),
            os_version: os_version(),
            architecture: std::env::consts::ARCH.to_string(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            cpu_count: num_cpus::get(),
            total_ram_bytes: total_ram(),
            numeric_stack: NUMERIC_STACK
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

fn os_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn total_ram() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Source-control identity of the build, read from the environment the
/// build pipeline is expected to stamp (`TAILSIM_GIT_COMMIT`,
/// `TAILSIM_GIT_DIRTY`, `TAILSIM_GIT_MODIFIED`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeVersion {
    pub provider: String,
    pub semver: String,
    pub revision: String,
    pub dirty: bool,
    pub modified_files: Vec<String>,
}

impl CodeVersion {
    /// Best-effort detection; `None` (with a warning) when no revision is
    /// available.
    pub fn detect() -> Option<Self> {
        let revision = match std::env::var("TAILSIM_GIT_COMMIT") {
            Ok(rev) if !rev.is_empty() => rev,
            _ => {
                tracing::warn!("no source-control revision available; recording null");
                return None;
            }
        };
        let dirty = std::env::var("TAILSIM_GIT_DIRTY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let modified_files = std::env::var("TAILSIM_GIT_MODIFIED")
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            provider: "git".to_string(),
            semver: env!("CARGO_PKG_VERSION").to_string(),
            revision,
            dirty,
            modified_files,
        })
    }

    /// `{provider}_{semver}_{iso8601_date}_{abbreviated_revision}`.
    pub fn identifier(&self) -> String {
        let rev: String = self.revision.chars().take(8).collect();
        format!(
            "{}_{}_{}_{}",
            self.provider,
            self.semver,
            Utc::now().format("%Y-%m-%d"),
            rev
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_fills_required_fields() {
        let env = EnvironmentInfo::capture();
        assert!(!env.os_name.is_empty());
        assert!(!env.architecture.is_empty());
        assert!(env.cpu_count >= 1);
        assert!(env.numeric_stack.contains_key("rand"));
    }

    #[test]
    fn identifier_has_four_segments() {
        let version = CodeVersion {
            provider: "git".to_string(),
            semver: "0.4.0".to_string(),
            revision: "abcdef0123456789".to_string(),
            dirty: false,
            modified_files: vec![],
        };
        let id = version.identifier();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "git");
        assert_eq!(parts[3], "abcdef01");
    }
}
