//! Drift detection between a recorded run and current data.
//!
//! Three drift classes are recognized. Schema drift is always fatal to a
//! replay; count drift beyond 10% and distribution drift (return mean or
//! standard deviation moving more than 20%) are fatal unless the caller
//! explicitly downgrades them to warnings.

use serde::{Deserialize, Serialize};

use crate::core::tuning::{COUNT_DRIFT_FATAL, DISTRIBUTION_DRIFT_FATAL};
use crate::repro::fingerprint::{DataFingerprint, ReturnsSummary};

/// Category of dataset drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    Schema,
    Count,
    Distribution,
}

impl DriftClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "SchemaDrift",
            Self::Count => "CountDrift",
            Self::Distribution => "DistributionDrift",
        }
    }
}

/// One detected drift instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub class: DriftClass,
    pub detail: String,
    /// Whether this finding aborts a replay absent an override.
    pub fatal: bool,
}

/// All drift findings for one replay attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriftReport {
    pub findings: Vec<DriftFinding>,
    /// True when fatal findings were downgraded by the caller's override.
    pub overridden: bool,
}

impl DriftReport {
    pub fn has_fatal(&self) -> bool {
        self.findings.iter().any(|f| f.fatal)
    }

    pub fn first_fatal(&self) -> Option<&DriftFinding> {
        self.findings.iter().find(|f| f.fatal)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Compares a recorded fingerprint and return summary against current data.
pub fn classify_drift(
    recorded: &DataFingerprint,
    current: &DataFingerprint,
    recorded_returns: &ReturnsSummary,
    current_returns: &ReturnsSummary,
) -> DriftReport {
    let mut findings = Vec::new();

    if recorded.schema != current.schema || recorded.interval != current.interval {
        findings.push(DriftFinding {
            class: DriftClass::Schema,
            detail: format!(
                "schema '{}' ({}) became '{}' ({})",
                recorded.schema, recorded.interval, current.schema, current.interval
            ),
            fatal: true,
        });
    }

    let count_change = if recorded.row_count > 0 {
        (current.row_count as f64 - recorded.row_count as f64).abs() / recorded.row_count as f64
    } else {
        0.0
    };
    if count_change > 0.0 {
        findings.push(DriftFinding {
            class: DriftClass::Count,
            detail: format!(
                "row_count {} became {} ({:+.1}%)",
                recorded.row_count,
                current.row_count,
                count_change * 100.0
            ),
            fatal: count_change > COUNT_DRIFT_FATAL,
        });
    }

    // Mean drift is scaled by the recorded dispersion; the raw mean of
    // daily log-returns hovers near zero and a pure ratio would be noise.
    let scale = recorded_returns.std.max(1.0e-12);
    let mean_shift = (current_returns.mean - recorded_returns.mean).abs() / scale;
    let std_shift = (current_returns.std - recorded_returns.std).abs() / scale;
    if mean_shift > DISTRIBUTION_DRIFT_FATAL || std_shift > DISTRIBUTION_DRIFT_FATAL {
        findings.push(DriftFinding {
            class: DriftClass::Distribution,
            detail: format!(
                "return mean shifted {mean_shift:.2}x and std {std_shift:.2}x of recorded std"
            ),
            fatal: true,
        });
    } else if recorded.content_hash != current.content_hash
        && findings.is_empty()
    {
        // Content changed without moving any tracked statistic.
        findings.push(DriftFinding {
            class: DriftClass::Distribution,
            detail: "content hash changed within statistical tolerance".to_string(),
            fatal: false,
        });
    }

    DriftReport {
        findings,
        overridden: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_bars, Interval};
    use crate::repro::fingerprint::fingerprint_bars;

    fn snapshot(n_bars: usize, vol: f64, seed: u64) -> (DataFingerprint, ReturnsSummary) {
        let bars = synthetic_bars("D", Interval::Daily, 100.0, n_bars, 0.0, vol, seed).unwrap();
        let fp = fingerprint_bars(&bars);
        let rs = ReturnsSummary::from_returns(&bars.log_returns());
        (fp, rs)
    }

    #[test]
    fn identical_data_is_clean() {
        let (fp, rs) = snapshot(300, 0.02, 1);
        let report = classify_drift(&fp, &fp, &rs, &rs);
        assert!(report.is_clean());
    }

    #[test]
    fn twenty_percent_row_growth_is_fatal_count_drift() {
        let (old_fp, old_rs) = snapshot(1000, 0.02, 1);
        let (new_fp, new_rs) = snapshot(1200, 0.02, 1);
        let report = classify_drift(&old_fp, &new_fp, &old_rs, &new_rs);
        let fatal = report.first_fatal().unwrap();
        assert_eq!(fatal.class, DriftClass::Count);
    }

    #[test]
    fn volatility_regime_change_is_distribution_drift() {
        let (old_fp, old_rs) = snapshot(500, 0.01, 2);
        let (new_fp, new_rs) = snapshot(500, 0.04, 2);
        let report = classify_drift(&old_fp, &new_fp, &old_rs, &new_rs);
        assert!(report
            .findings
            .iter()
            .any(|f| f.class == DriftClass::Distribution && f.fatal));
    }

    #[test]
    fn small_count_changes_warn_without_aborting() {
        let (old_fp, old_rs) = snapshot(1000, 0.02, 3);
        let (new_fp, new_rs) = snapshot(1050, 0.02, 3);
        let report = classify_drift(&old_fp, &new_fp, &old_rs, &new_rs);
        assert!(!report.has_fatal() || report.findings.iter().all(|f| f.class != DriftClass::Schema));
        let count = report
            .findings
            .iter()
            .find(|f| f.class == DriftClass::Count)
            .unwrap();
        assert!(!count.fatal);
    }
}
