//! Candidate selection and episode building.
//!
//! A selector filters a bar history into [`CandidateEpisode`]s whose state
//! features are computed strictly from information available before the
//! episode's start bar. The default selector keys on the absolute overnight
//! gap and a rolling volume z-score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::tuning::SELECTOR_MIN_EPISODES;
use crate::core::{EngineError, Result};
use crate::data::DataBars;

/// A (symbol, t0, horizon) triple with attached state features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEpisode {
    pub symbol: String,
    /// Bar index of the episode start within its source history.
    pub t0_index: usize,
    pub t0_timestamp: DateTime<Utc>,
    /// Number of bar intervals the episode spans.
    pub horizon: usize,
    pub state_features: BTreeMap<String, f64>,
    pub selector_name: String,
    pub score: f64,
}

/// Rule set that filters bar histories into candidate episodes.
pub trait CandidateSelector: Send + Sync {
    fn name(&self) -> &'static str;
    /// Features each emitted episode must carry.
    fn feature_requirements(&self) -> &'static [&'static str];
    /// Bars of history required before the first candidate can be scored.
    fn min_lookback(&self) -> usize;
    fn min_episodes(&self) -> usize {
        SELECTOR_MIN_EPISODES
    }
    fn select(&self, bars: &DataBars) -> Result<Vec<CandidateEpisode>>;
}

/// Selector choice plus free-form parameters, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// Instantiates a registered selector from its spec.
pub fn get_selector(spec: &SelectorSpec) -> Result<Box<dyn CandidateSelector>> {
    match spec.name.as_str() {
        "gap_volume" => Ok(Box::new(GapVolumeSelector::from_params(&spec.params)?)),
        other => Err(EngineError::Config(format!(
            "selector: '{other}'; only gap_volume is registered"
        ))),
    }
}

/// Result of screening a symbol universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenReport {
    pub selector_name: String,
    pub symbols_screened: usize,
    /// Episodes across the universe, best score first.
    pub episodes: Vec<CandidateEpisode>,
    /// True when the yield fell below the selector's minimum.
    pub sparse: bool,
}

/// Runs a selector across a universe, merging and ranking episodes.
pub fn screen_universe(
    universe: &[DataBars],
    selector: &dyn CandidateSelector,
    top_n: Option<usize>,
) -> Result<ScreenReport> {
    let mut episodes = Vec::new();
    for bars in universe {
        episodes.extend(selector.select(bars)?);
    }
    episodes.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.symbol.cmp(&b.symbol))
            .then_with(|| a.t0_index.cmp(&b.t0_index))
    });
    if let Some(n) = top_n {
        episodes.truncate(n);
    }

    let sparse = episodes.len() < selector.min_episodes();
    if sparse {
        tracing::warn!(
            selector = selector.name(),
            produced = episodes.len(),
            min = selector.min_episodes(),
            "selector produced fewer episodes than its minimum"
        );
    }

    Ok(ScreenReport {
        selector_name: selector.name().to_string(),
        symbols_screened: universe.len(),
        episodes,
        sparse,
    })
}

/// Default selector: overnight gap with confirming volume.
///
/// A bar qualifies when `|gap_pct| >= gap_min` and `volume_z >= volume_z_min`,
/// where the volume statistics come from the window ending at the previous
/// bar. Score is `|gap_pct| + max(volume_z, 0)`.
#[derive(Debug, Clone)]
pub struct GapVolumeSelector {
    pub gap_min: f64,
    pub volume_z_min: f64,
    pub horizon: usize,
    pub volume_window: usize,
}

impl GapVolumeSelector {
    pub fn from_params(params: &BTreeMap<String, f64>) -> Result<Self> {
        let gap_min = params.get("gap_min").copied().unwrap_or(0.03);
        let volume_z_min = params.get("volume_z_min").copied().unwrap_or(1.5);
        let horizon = params.get("horizon").copied().unwrap_or(10.0) as usize;
        let volume_window = params.get("volume_window").copied().unwrap_or(20.0) as usize;

        if gap_min <= 0.0 || !gap_min.is_finite() {
            return Err(EngineError::Config(format!(
                "selector.gap_min: {gap_min}; must be finite and > 0"
            )));
        }
        if horizon == 0 {
            return Err(EngineError::Config(
                "selector.horizon: 0; episodes must span at least one bar".to_string(),
            ));
        }
        if volume_window < 2 {
            return Err(EngineError::Config(format!(
                "selector.volume_window: {volume_window}; need at least 2 bars of volume history"
            )));
        }
        Ok(Self {
            gap_min,
            volume_z_min,
            horizon,
            volume_window,
        })
    }
}

impl CandidateSelector for GapVolumeSelector {
    fn name(&self) -> &'static str {
        "gap_volume"
    }

    fn feature_requirements(&self) -> &'static [&'static str] {
        &["gap_pct", "volume_z"]
    }

    fn min_lookback(&self) -> usize {
        self.volume_window + 1
    }

    fn select(&self, bars: &DataBars) -> Result<Vec<CandidateEpisode>> {
        let n = bars.len();
        let mut episodes = Vec::new();
        if n <= self.min_lookback() {
            return Ok(episodes);
        }

        for t in self.min_lookback()..n {
            let prev_close = bars.bar(t - 1).close;
            let gap_pct = (bars.bar(t).open - prev_close) / prev_close;

            // Volume statistics over [t - window, t): strictly before t.
            let window: Vec<f64> = (t - self.volume_window..t)
                .map(|i| bars.bar(i).volume)
                .collect();
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let var = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
                / (window.len() - 1) as f64;
            let std = var.sqrt();
            let volume_z = if std > 0.0 {
                (bars.bar(t).volume - mean) / std
            } else {
                0.0
            };

            if gap_pct.abs() >= self.gap_min && volume_z >= self.volume_z_min {
                let mut state = BTreeMap::new();
                state.insert("gap_pct".to_string(), gap_pct);
                state.insert("volume_z".to_string(), volume_z);
                episodes.push(CandidateEpisode {
                    symbol: bars.symbol().to_string(),
                    t0_index: t,
                    t0_timestamp: bars.bar(t).timestamp,
                    horizon: self.horizon,
                    state_features: state,
                    selector_name: self.name().to_string(),
                    score: gap_pct.abs() + volume_z.max(0.0),
                });
            }
        }

        episodes.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(episodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Bar, Interval};
    use chrono::{Duration, TimeZone};

    /// Flat series with one engineered gap + volume spike at index `spike`.
    fn bars_with_event(spike: usize, n: usize) -> DataBars {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut bars = Vec::with_capacity(n);
        let mut close = 100.0;
        for i in 0..n {
            let open = if i == spike { close * 1.06 } else { close };
            let next_close = if i == spike { open } else { close };
            let volume = if i == spike { 5.0e6 } else { 1.0e6 + (i % 7) as f64 * 1.0e4 };
            bars.push(Bar {
                timestamp: t0 + Duration::days(i as i64),
                open,
                high: open.max(next_close) * 1.01,
                low: open.min(next_close) * 0.99,
                close: next_close,
                volume,
            });
            close = next_close;
        }
        DataBars::new("GAP", Interval::Daily, bars).unwrap()
    }

    #[test]
    fn detects_the_engineered_event() {
        let bars = bars_with_event(40, 80);
        let selector = GapVolumeSelector::from_params(&BTreeMap::new()).unwrap();
        let episodes = selector.select(&bars).unwrap();
        assert_eq!(episodes.len(), 1);
        let ep = &episodes[0];
        assert_eq!(ep.t0_index, 40);
        assert!(ep.state_features["gap_pct"] > 0.05);
        assert!(ep.state_features["volume_z"] > 1.5);
        assert!(ep.score > ep.state_features["gap_pct"]);
    }

    #[test]
    fn quiet_series_yields_nothing() {
        let bars = bars_with_event(usize::MAX, 60);
        let selector = GapVolumeSelector::from_params(&BTreeMap::new()).unwrap();
        assert!(selector.select(&bars).unwrap().is_empty());
    }

    #[test]
    fn universe_screen_ranks_and_flags_sparsity() {
        let a = bars_with_event(40, 80);
        let selector = GapVolumeSelector::from_params(&BTreeMap::new()).unwrap();
        let report = screen_universe(&[a], &selector, Some(10)).unwrap();
        assert_eq!(report.episodes.len(), 1);
        assert!(report.sparse);
    }
}
