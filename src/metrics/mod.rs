//! Risk and performance metrics.
//!
//! Summary statistics are computed from per-path total P&L and the mean
//! equity curve across paths. Tail metrics use the loss-positive
//! convention and are reported twice: over all paths, and conditionally
//! with bankrupt paths excluded.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::tuning::{
    CONTRACT_MULTIPLIER, DEFAULT_FEE_PER_CONTRACT, DEFAULT_FEE_PER_SHARE, DEFAULT_SLIPPAGE_BPS,
    TRADING_DAYS_PER_YEAR, VAR_ALPHA,
};
use crate::core::Result;
use crate::pricing::norm_cdf;
use crate::repro::write_atomic;

/// Transaction-cost model applied at every position change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Slippage in basis points of traded notional.
    pub slippage_bps: f64,
    pub fee_per_share: f64,
    pub fee_per_contract: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            fee_per_share: DEFAULT_FEE_PER_SHARE,
            fee_per_contract: DEFAULT_FEE_PER_CONTRACT,
        }
    }
}

impl CostModel {
    /// Cost of changing a stock position by `delta_shares` at `price`.
    pub fn stock_trade_cost(&self, delta_shares: f64, price: f64) -> f64 {
        let shares = delta_shares.abs();
        shares * self.fee_per_share + shares * price * self.slippage_bps / 1.0e4
    }

    /// Cost of changing an option position by `delta_contracts` at `premium`.
    pub fn option_trade_cost(&self, delta_contracts: f64, premium: f64) -> f64 {
        let contracts = delta_contracts.abs();
        contracts * self.fee_per_contract
            + contracts * premium.max(0.0) * CONTRACT_MULTIPLIER * self.slippage_bps / 1.0e4
    }
}

/// VaR estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
    #[default]
    Historical,
    Parametric,
}

impl VarMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Parametric => "parametric",
        }
    }
}

/// Dispersion estimator for parametric VaR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceEstimator {
    #[default]
    Sample,
    /// Light shrinkage of the variance toward the squared mean.
    ShrinkageDelta,
}

/// One set of summary statistics over a path population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub mean_pnl: f64,
    pub median_pnl: f64,
    pub sharpe: f64,
    pub sortino: f64,
    /// Peak-to-trough loss of the mean equity curve, as a positive fraction.
    pub max_drawdown: f64,
    /// Loss-positive 5% Value-at-Risk of per-path P&L.
    pub var: f64,
    /// Loss-positive 5% expected shortfall of per-path P&L.
    pub cvar: f64,
    pub n_paths: usize,
}

/// Full metrics artifact for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// All paths included.
    pub unconditional: MetricsSummary,
    /// Bankrupt paths excluded.
    pub conditional: MetricsSummary,
    pub bankruptcy_rate: f64,
    pub early_exercise_events: usize,
    pub var_method: VarMethod,
    pub covariance_estimator: CovarianceEstimator,
    pub n_steps: usize,
    /// Composite objective; populated during grid ranking.
    #[serde(default)]
    pub objective_score: Option<f64>,
}

/// Peak-to-trough decline of an equity curve, as a positive fraction.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst: f64 = 0.0;
    for &v in equity {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.max((peak - v) / peak);
        }
    }
    worst
}

/// Annualized Sharpe ratio of step returns.
pub fn sharpe_ratio(step_returns: &[f64], risk_free_annual: f64) -> f64 {
    if step_returns.is_empty() {
        return 0.0;
    }
    let rf_step = risk_free_annual / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = step_returns.iter().map(|r| r - rf_step).collect();
    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    let var = excess.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / excess.len() as f64;
    let std = var.sqrt();
    if std <= 0.0 {
        0.0
    } else {
        mean / std * TRADING_DAYS_PER_YEAR.sqrt()
    }
}

/// Annualized Sortino ratio of step returns (downside deviation only).
pub fn sortino_ratio(step_returns: &[f64], risk_free_annual: f64) -> f64 {
    if step_returns.is_empty() {
        return 0.0;
    }
    let rf_step = risk_free_annual / TRADING_DAYS_PER_YEAR;
    let mean = step_returns.iter().sum::<f64>() / step_returns.len() as f64;
    let downside: Vec<f64> = step_returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return 0.0;
    }
    let dvar = downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64;
    let dstd = dvar.sqrt();
    if dstd <= 0.0 {
        0.0
    } else {
        (mean - rf_step) / dstd * TRADING_DAYS_PER_YEAR.sqrt()
    }
}

/// Loss-positive VaR and CVaR of a P&L sample.
pub fn var_cvar(
    pnl: &[f64],
    method: VarMethod,
    estimator: CovarianceEstimator,
) -> (f64, f64) {
    if pnl.is_empty() {
        return (0.0, 0.0);
    }
    let threshold = match method {
        VarMethod::Historical => percentile(pnl, VAR_ALPHA),
        VarMethod::Parametric => {
            let mean = pnl.iter().sum::<f64>() / pnl.len() as f64;
            let var = pnl.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / pnl.len() as f64;
            let mut std = var.sqrt();
            if estimator == CovarianceEstimator::ShrinkageDelta {
                std = (0.9 * std * std + 0.1 * mean * mean).sqrt();
            }
            mean + std * normal_quantile(VAR_ALPHA)
        }
    };
    let tail: Vec<f64> = pnl.iter().copied().filter(|x| *x <= threshold).collect();
    let cvar_level = if tail.is_empty() {
        threshold
    } else {
        tail.iter().sum::<f64>() / tail.len() as f64
    };
    ((-threshold).max(0.0), (-cvar_level).max(0.0))
}

/// Linear-interpolated quantile of an unsorted sample.
fn percentile(sample: &[f64], p: f64) -> f64 {
    let mut sorted: Vec<f64> = sample.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p * (sorted.len() as f64 - 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let w = rank - lo as f64;
        sorted[lo] + w * (sorted[hi] - sorted[lo])
    }
}

/// Inverse standard normal CDF via bisection on the forward CDF.
fn normal_quantile(p: f64) -> f64 {
    let (mut lo, mut hi) = (-10.0, 10.0);
    for _ in 0..80 {
        let mid = 0.5 * (lo + hi);
        if norm_cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Builds one summary from per-path P&L and a mean equity curve.
pub fn summarize(
    pnl: &[f64],
    mean_equity: &[f64],
    var_method: VarMethod,
    estimator: CovarianceEstimator,
    risk_free_annual: f64,
) -> MetricsSummary {
    let n = pnl.len();
    let mean_pnl = if n == 0 {
        0.0
    } else {
        pnl.iter().sum::<f64>() / n as f64
    };
    let median_pnl = if n == 0 { 0.0 } else { percentile(pnl, 0.5) };

    let step_returns: Vec<f64> = mean_equity
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();

    let (var, cvar) = var_cvar(pnl, var_method, estimator);
    MetricsSummary {
        mean_pnl,
        median_pnl,
        sharpe: sharpe_ratio(&step_returns, risk_free_annual),
        sortino: sortino_ratio(&step_returns, risk_free_annual),
        max_drawdown: max_drawdown(mean_equity),
        var,
        cvar,
        n_paths: n,
    }
}

/// Field order shared by the JSON and CSV writers.
fn flat_fields(report: &MetricsReport) -> Vec<(&'static str, String)> {
    let f = |v: f64| format!("{v:.6}");
    vec![
        ("mean_pnl", f(report.unconditional.mean_pnl)),
        ("median_pnl", f(report.unconditional.median_pnl)),
        ("sharpe", f(report.unconditional.sharpe)),
        ("sortino", f(report.unconditional.sortino)),
        ("max_drawdown", f(report.unconditional.max_drawdown)),
        ("var", f(report.unconditional.var)),
        ("cvar", f(report.unconditional.cvar)),
        ("mean_pnl_ex_bankrupt", f(report.conditional.mean_pnl)),
        ("sharpe_ex_bankrupt", f(report.conditional.sharpe)),
        ("var_ex_bankrupt", f(report.conditional.var)),
        ("cvar_ex_bankrupt", f(report.conditional.cvar)),
        ("bankruptcy_rate", f(report.bankruptcy_rate)),
        (
            "early_exercise_events",
            report.early_exercise_events.to_string(),
        ),
        ("var_method", report.var_method.as_str().to_string()),
        (
            "objective_score",
            report
                .objective_score
                .map(|v| format!("{v:.6}"))
                .unwrap_or_default(),
        ),
    ]
}

/// Writes `metrics.json` (full report) atomically.
pub fn write_metrics_json(report: &MetricsReport, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(report)?;
    write_atomic(path, text.as_bytes())
}

/// Writes `metrics.csv` with the flattened schema, aligned with the JSON.
pub fn write_metrics_csv(report: &MetricsReport, path: &Path) -> Result<()> {
    let fields = flat_fields(report);
    let header: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
    let values: Vec<&str> = fields.iter().map(|(_, v)| v.as_str()).collect();
    let text = format!("{}\n{}\n", header.join(","), values.join(","));
    write_atomic(path, text.as_bytes())
}
