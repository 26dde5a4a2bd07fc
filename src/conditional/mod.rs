//! State-conditioned Monte Carlo.
//!
//! Conditioning narrows the sampling population to historical episodes
//! whose state features sit close to a target state in z-space. Two
//! methods are supported: a non-parametric bootstrap over matched episode
//! windows (default) and a parametric refit of the base family on the
//! union of matched returns. Both fall back to unconditional sampling with
//! a warning when too few episodes match; whatever actually ran is
//! recorded on the run.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::tuning::{CONDITIONAL_DISTANCE_Z, CONDITIONAL_MIN_MATCH};
use crate::core::{EngineError, Result};
use crate::data::DataBars;
use crate::mc::{generate, PathSettings, PricePaths, StorageDecision};
use crate::models::{fit, FitOptions, ModelKind, RowSampler};
use crate::repro::seeds::path_seed;
use crate::screen::CandidateEpisode;

/// Conditional sampling method requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalMethod {
    Bootstrap,
    ParametricRefit,
}

impl ConditionalMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::ParametricRefit => "parametric_refit",
        }
    }
}

/// What the conditional stage actually did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditioningReport {
    pub requested_method: ConditionalMethod,
    /// `bootstrap`, `parametric_refit`, or `unconditional`.
    pub method_used: String,
    pub episode_count: usize,
    pub matched_count: usize,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
}

/// Non-parametric sampler over matched episode return windows.
///
/// Each path draws a window (with replacement) from its derived stream and
/// takes a contiguous slice, tiling short windows to fill the row. Slicing
/// rather than shuffling preserves local return structure.
pub struct EpisodeBootstrap {
    windows: Vec<Vec<f64>>,
}

impl EpisodeBootstrap {
    pub fn new(windows: Vec<Vec<f64>>) -> Result<Self> {
        let windows: Vec<Vec<f64>> = windows.into_iter().filter(|w| !w.is_empty()).collect();
        if windows.is_empty() {
            return Err(EngineError::Data(
                "episodes: no non-empty return windows to bootstrap from".to_string(),
            ));
        }
        Ok(Self { windows })
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

impl RowSampler for EpisodeBootstrap {
    fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        let mut rng = ChaCha12Rng::seed_from_u64(path_seed(base_seed, row));
        let window = &self.windows[rng.random_range(0..self.windows.len())];
        if window.len() >= out.len() {
            let start = rng.random_range(0..=window.len() - out.len());
            out.copy_from_slice(&window[start..start + out.len()]);
        } else {
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = window[i % window.len()];
            }
        }
    }
}

/// Episodes within the z-space distance threshold of the target state.
///
/// Features are standardized by their mean and standard deviation across
/// the episode set; the target is standardized with the same statistics.
pub fn match_episodes<'a>(
    episodes: &'a [CandidateEpisode],
    target_state: &BTreeMap<String, f64>,
    distance_threshold: f64,
) -> Vec<&'a CandidateEpisode> {
    if target_state.is_empty() || episodes.is_empty() {
        return episodes.iter().collect();
    }

    let keys: Vec<&String> = target_state.keys().collect();
    let mut stats: BTreeMap<&String, (f64, f64)> = BTreeMap::new();
    for key in &keys {
        let values: Vec<f64> = episodes
            .iter()
            .filter_map(|e| e.state_features.get(*key).copied())
            .collect();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        stats.insert(key, (mean, var.sqrt().max(1.0e-12)));
    }

    episodes
        .iter()
        .filter(|episode| {
            let mut dist2 = 0.0;
            for key in &keys {
                let Some((mean, std)) = stats.get(*key) else {
                    continue;
                };
                let target_z = (target_state[*key] - mean) / std;
                let episode_z = episode
                    .state_features
                    .get(*key)
                    .map(|v| (v - mean) / std)
                    .unwrap_or(0.0);
                let d = episode_z - target_z;
                dist2 += d * d;
            }
            dist2.sqrt() <= distance_threshold
        })
        .collect()
}

/// Log-return window covered by one episode, clipped to the history.
fn episode_returns(bars: &DataBars, episode: &CandidateEpisode) -> Vec<f64> {
    let start = episode.t0_index;
    let end = (start + episode.horizon).min(bars.len() - 1);
    if end <= start {
        return Vec::new();
    }
    (start..end)
        .map(|i| (bars.bar(i + 1).close / bars.bar(i).close).ln())
        .collect()
}

/// Generates conditional price paths, recording the method actually used.
#[allow(clippy::too_many_arguments)]
pub fn conditional_paths(
    bars: &DataBars,
    episodes: &[CandidateEpisode],
    target_state: &BTreeMap<String, f64>,
    method: ConditionalMethod,
    base_model: ModelKind,
    fit_opts: &FitOptions,
    settings: &PathSettings,
    decision: &StorageDecision,
    backing_dir: Option<&Path>,
) -> Result<(PricePaths, ConditioningReport)> {
    let matched = match_episodes(episodes, target_state, CONDITIONAL_DISTANCE_Z);
    let matched_count = matched.len();

    let mut report = ConditioningReport {
        requested_method: method,
        method_used: method.as_str().to_string(),
        episode_count: episodes.len(),
        matched_count,
        fallback_used: false,
        fallback_reason: None,
    };

    if matched_count < CONDITIONAL_MIN_MATCH {
        let reason = format!(
            "matched {matched_count} episodes, below the minimum {CONDITIONAL_MIN_MATCH}"
        );
        tracing::warn!(
            matched = matched_count,
            min = CONDITIONAL_MIN_MATCH,
            "conditional sampling falling back to unconditional"
        );
        let dist = fit(base_model, &bars.log_returns(), settings.seed, fit_opts)?;
        let paths = generate(&dist, settings, decision, backing_dir)?;
        report.method_used = "unconditional".to_string();
        report.fallback_used = true;
        report.fallback_reason = Some(reason);
        return Ok((paths, report));
    }

    match method {
        ConditionalMethod::Bootstrap => {
            let windows: Vec<Vec<f64>> =
                matched.iter().map(|e| episode_returns(bars, e)).collect();
            let bootstrap = EpisodeBootstrap::new(windows)?;
            tracing::info!(
                windows = bootstrap.window_count(),
                "conditional sampling via episode bootstrap"
            );
            let paths = generate(&bootstrap, settings, decision, backing_dir)?;
            Ok((paths, report))
        }
        ConditionalMethod::ParametricRefit => {
            let pooled: Vec<f64> = matched
                .iter()
                .flat_map(|e| episode_returns(bars, e))
                .collect();
            match fit(base_model, &pooled, settings.seed, fit_opts) {
                Ok(dist) => {
                    tracing::info!(
                        samples = pooled.len(),
                        model = base_model.as_str(),
                        "conditional sampling via parametric refit"
                    );
                    let paths = generate(&dist, settings, decision, backing_dir)?;
                    Ok((paths, report))
                }
                Err(err) => {
                    let reason = format!("refit on {} pooled samples failed: {err}", pooled.len());
                    tracing::warn!(reason = %reason, "parametric refit falling back to unconditional");
                    let dist = fit(base_model, &bars.log_returns(), settings.seed, fit_opts)?;
                    let paths = generate(&dist, settings, decision, backing_dir)?;
                    report.method_used = "unconditional".to_string();
                    report.fallback_used = true;
                    report.fallback_reason = Some(reason);
                    Ok((paths, report))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StorageTag;
    use crate::data::{synthetic_bars, Interval};
    use chrono::{TimeZone, Utc};

    fn episode(symbol: &str, t0: usize, gap: f64, volz: f64) -> CandidateEpisode {
        let mut state = BTreeMap::new();
        state.insert("gap_pct".to_string(), gap);
        state.insert("volume_z".to_string(), volz);
        CandidateEpisode {
            symbol: symbol.to_string(),
            t0_index: t0,
            t0_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            horizon: 10,
            state_features: state,
            selector_name: "gap_volume".to_string(),
            score: gap.abs() + volz.max(0.0),
        }
    }

    fn mem_decision(n_paths: usize) -> StorageDecision {
        StorageDecision {
            tag: StorageTag::Memory,
            chunk_rows: n_paths,
            footprint: 0,
            budget: 0,
        }
    }

    #[test]
    fn matching_filters_by_z_distance() {
        let mut episodes: Vec<CandidateEpisode> = (0..20)
            .map(|i| episode("A", i * 5, 0.04 + 0.001 * i as f64, 2.0))
            .collect();
        // One far outlier.
        episodes.push(episode("A", 200, 0.50, 9.0));

        let mut target = BTreeMap::new();
        target.insert("gap_pct".to_string(), 0.045);
        target.insert("volume_z".to_string(), 2.0);

        let matched = match_episodes(&episodes, &target, 2.0);
        assert_eq!(matched.len(), 20);
    }

    #[test]
    fn sparse_matches_fall_back_to_unconditional() {
        let bars = synthetic_bars("A", Interval::Daily, 100.0, 400, 0.0, 0.02, 5).unwrap();
        let episodes: Vec<CandidateEpisode> =
            (0..3).map(|i| episode("A", 30 + i * 40, 0.05, 2.0)).collect();

        let settings = PathSettings {
            s0: 100.0,
            n_paths: 32,
            n_steps: 10,
            seed: 42,
        };
        let (paths, report) = conditional_paths(
            &bars,
            &episodes,
            &BTreeMap::new(),
            ConditionalMethod::Bootstrap,
            ModelKind::Laplace,
            &FitOptions::default(),
            &settings,
            &mem_decision(32),
            None,
        )
        .unwrap();

        assert!(report.fallback_used);
        assert_eq!(report.method_used, "unconditional");
        assert_eq!(paths.n_paths(), 32);
    }

    #[test]
    fn bootstrap_samples_only_episode_returns() {
        let bars = synthetic_bars("A", Interval::Daily, 100.0, 400, 0.0, 0.02, 6).unwrap();
        let episodes: Vec<CandidateEpisode> =
            (0..12).map(|i| episode("A", 20 + i * 25, 0.05, 2.0)).collect();

        let settings = PathSettings {
            s0: 100.0,
            n_paths: 64,
            n_steps: 8,
            seed: 42,
        };
        let (paths, report) = conditional_paths(
            &bars,
            &episodes,
            &BTreeMap::new(),
            ConditionalMethod::Bootstrap,
            ModelKind::Laplace,
            &FitOptions::default(),
            &settings,
            &mem_decision(64),
            None,
        )
        .unwrap();
        assert!(!report.fallback_used);
        assert_eq!(report.method_used, "bootstrap");

        // Every sampled step return must appear in some episode window.
        let mut allowed: Vec<f64> = Vec::new();
        for e in &episodes {
            allowed.extend(episode_returns(&bars, e));
        }
        let values = paths.to_vec().unwrap();
        let width = settings.n_steps + 1;
        for row in 0..4 {
            for t in 0..settings.n_steps {
                let r = (values[row * width + t + 1] / values[row * width + t]).ln();
                assert!(
                    allowed.iter().any(|a| (a - r).abs() < 1.0e-9),
                    "return {r} not drawn from episode windows"
                );
            }
        }
    }

    #[test]
    fn refit_path_produces_report() {
        let bars = synthetic_bars("A", Interval::Daily, 100.0, 600, 0.0, 0.02, 7).unwrap();
        let episodes: Vec<CandidateEpisode> =
            (0..15).map(|i| episode("A", 10 + i * 35, 0.05, 2.0)).collect();

        let settings = PathSettings {
            s0: 100.0,
            n_paths: 16,
            n_steps: 12,
            seed: 9,
        };
        let (_, report) = conditional_paths(
            &bars,
            &episodes,
            &BTreeMap::new(),
            ConditionalMethod::ParametricRefit,
            ModelKind::Laplace,
            &FitOptions::default(),
            &settings,
            &mem_decision(16),
            None,
        )
        .unwrap();
        assert_eq!(report.requested_method, ConditionalMethod::ParametricRefit);
        assert_eq!(report.matched_count, 15);
    }
}
