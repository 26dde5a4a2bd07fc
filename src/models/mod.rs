//! Heavy-tailed return-distribution models.
//!
//! Four families are supported: Laplace, Normal, Student-t, and
//! GARCH(1,1)-t. Fitting is maximum likelihood with bounded searches;
//! every fit produces a [`FitRecord`] carrying parameters, likelihood,
//! information criteria, and a status grade driven by the fitted
//! distribution's excess kurtosis. Sampling draws from per-path ChaCha
//! streams derived from the caller seed, so a sample matrix is identical
//! for any chunking of its rows.

pub mod garch;
pub mod laplace;
pub mod normal;
pub mod stationarity;
pub mod student_t;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::tuning::{KURTOSIS_SUCCESS, KURTOSIS_WARN, MIN_SAMPLES_GARCH, MIN_SAMPLES_IID};
use crate::core::{EngineError, FitFailure, FitStatus, Result};
use self::stationarity::{check_stationarity, difference};

/// Distribution family identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Laplace,
    Normal,
    StudentT,
    GarchT,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Laplace => "laplace",
            Self::Normal => "normal",
            Self::StudentT => "student_t",
            Self::GarchT => "garch_t",
        }
    }

    pub fn from_str(name: &str) -> Result<Self> {
        match name {
            "laplace" => Ok(Self::Laplace),
            "normal" => Ok(Self::Normal),
            "student_t" => Ok(Self::StudentT),
            "garch_t" => Ok(Self::GarchT),
            other => Err(EngineError::Config(format!(
                "distribution: '{other}'; expected one of laplace, normal, student_t, garch_t"
            ))),
        }
    }

    /// Minimum log-return window the family requires.
    pub fn min_samples(self) -> usize {
        match self {
            Self::GarchT => MIN_SAMPLES_GARCH,
            _ => MIN_SAMPLES_IID,
        }
    }
}

/// Caller-facing fit controls.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// First-difference a non-stationary series instead of failing.
    pub allow_transform: bool,
    /// Fall back to a method-of-moments Laplace on recoverable failures.
    pub fallback_to_default: bool,
    /// Grade and enforce the fitted distribution's tail heaviness.
    pub enforce_heavy_tails: bool,
    /// Iteration budget for the bounded likelihood searches.
    pub max_iterations: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            allow_transform: false,
            fallback_to_default: false,
            enforce_heavy_tails: true,
            max_iterations: 10_000,
        }
    }
}

/// Artifact of a completed fit. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub model: ModelKind,
    pub params: BTreeMap<String, f64>,
    pub fit_window: usize,
    pub seed: u64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub status: FitStatus,
    /// Excess kurtosis of the fitted distribution, capped for serialization.
    pub excess_kurtosis: f64,
    pub iterations: usize,
    pub tolerance: f64,
    /// True when the input series was first-differenced before fitting.
    pub differenced: bool,
    /// Family originally requested when this record came from a fallback.
    pub fallback_from: Option<ModelKind>,
}

/// Anything that can fill one path row of log-returns from a derived
/// per-row stream. Implemented by the parametric families and by the
/// episode bootstrap.
pub trait RowSampler: Send + Sync {
    fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]);
}

impl RowSampler for ReturnDistribution {
    fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        ReturnDistribution::fill_row(self, base_seed, row, out);
    }
}

/// A fitted return distribution ready for sampling.
#[derive(Debug, Clone)]
pub enum ReturnDistribution {
    Laplace(laplace::Laplace),
    Normal(normal::NormalReturns),
    StudentT(student_t::StudentTReturns),
    GarchT(garch::GarchT),
}

impl ReturnDistribution {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Laplace(_) => ModelKind::Laplace,
            Self::Normal(_) => ModelKind::Normal,
            Self::StudentT(_) => ModelKind::StudentT,
            Self::GarchT(_) => ModelKind::GarchT,
        }
    }

    pub fn record(&self) -> &FitRecord {
        match self {
            Self::Laplace(m) => &m.record,
            Self::Normal(m) => &m.record,
            Self::StudentT(m) => &m.record,
            Self::GarchT(m) => &m.record,
        }
    }

    /// Fills one row of log-returns from the stream derived for `row`.
    pub fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        match self {
            Self::Laplace(m) => m.fill_row(base_seed, row, out),
            Self::Normal(m) => m.fill_row(base_seed, row, out),
            Self::StudentT(m) => m.fill_row(base_seed, row, out),
            Self::GarchT(m) => m.fill_row(base_seed, row, out),
        }
    }

    /// Samples a row-major `(n_paths, n_steps)` log-return matrix.
    pub fn sample_matrix(&self, n_paths: usize, n_steps: usize, seed: u64) -> Vec<f64> {
        let mut out = vec![0.0; n_paths * n_steps];
        for row in 0..n_paths {
            self.fill_row(seed, row, &mut out[row * n_steps..(row + 1) * n_steps]);
        }
        out
    }
}

/// Fits `kind` to a log-return series.
///
/// The series goes through the stationarity gate first, then the family's
/// bounded maximum-likelihood estimator, then tail grading. Recoverable
/// failures (non-convergence, implausible parameters) are converted into a
/// method-of-moments Laplace when `fallback_to_default` is set.
pub fn fit(
    kind: ModelKind,
    returns: &[f64],
    seed: u64,
    opts: &FitOptions,
) -> Result<ReturnDistribution> {
    validate_input(returns, kind)?;

    let mut series: Vec<f64> = returns.to_vec();
    let mut differenced = false;
    let check = check_stationarity(&series);
    if !check.stationary {
        if !opts.allow_transform {
            return Err(EngineError::Fit(
                FitFailure::NonStationary,
                format!(
                    "returns: ADF statistic {:.3} fails the unit-root test; \
                     pass allow_transform=true to first-difference",
                    check.adf_statistic
                ),
            ));
        }
        series = difference(&series);
        differenced = true;
        validate_input(&series, kind)?;
        tracing::info!(model = kind.as_str(), "input differenced before fit");
    }

    if kind != ModelKind::GarchT {
        let post = check_stationarity(&series);
        if post.ar_structure {
            return Err(EngineError::Fit(
                FitFailure::NonStationary,
                format!(
                    "returns: lag-1 autocorrelation {:.3} exceeds the IID tolerance; \
                     use garch_t or whiten the series",
                    post.lag1_autocorrelation
                ),
            ));
        }
    }

    let fitted = match kind {
        ModelKind::Laplace => laplace::fit(&series, seed, opts).map(ReturnDistribution::Laplace),
        ModelKind::Normal => normal::fit(&series, seed, opts).map(ReturnDistribution::Normal),
        ModelKind::StudentT => {
            student_t::fit(&series, seed, opts).map(ReturnDistribution::StudentT)
        }
        ModelKind::GarchT => garch::fit(&series, seed, opts).map(ReturnDistribution::GarchT),
    };

    let mut dist = match fitted {
        Ok(d) => d,
        Err(EngineError::Fit(failure, msg))
            if opts.fallback_to_default
                && matches!(
                    failure,
                    FitFailure::NonConvergence | FitFailure::ImplausibleParams
                ) =>
        {
            tracing::warn!(
                model = kind.as_str(),
                reason = %msg,
                "fit failed; falling back to method-of-moments laplace"
            );
            ReturnDistribution::Laplace(laplace::fit_method_of_moments(&series, seed, Some(kind)))
        }
        Err(other) => return Err(other),
    };
    set_differenced(&mut dist, differenced);

    if opts.enforce_heavy_tails && dist.record().status == FitStatus::Fail {
        let excess = dist.record().excess_kurtosis;
        if opts.fallback_to_default && dist.kind() != ModelKind::Laplace {
            tracing::warn!(
                model = dist.kind().as_str(),
                excess_kurtosis = excess,
                "thin-tailed fit; falling back to method-of-moments laplace"
            );
            let mut fallback = ReturnDistribution::Laplace(laplace::fit_method_of_moments(
                &series,
                seed,
                Some(kind),
            ));
            set_differenced(&mut fallback, differenced);
            return Ok(fallback);
        }
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            format!(
                "excess_kurtosis: {excess:.3} below the {KURTOSIS_WARN} floor for a \
                 heavy-tailed engine; choose laplace/student_t/garch_t, enable \
                 fallback_to_default, or disable enforcement"
            ),
        ));
    }
    Ok(dist)
}

fn set_differenced(dist: &mut ReturnDistribution, differenced: bool) {
    let record = match dist {
        ReturnDistribution::Laplace(m) => &mut m.record,
        ReturnDistribution::Normal(m) => &mut m.record,
        ReturnDistribution::StudentT(m) => &mut m.record,
        ReturnDistribution::GarchT(m) => &mut m.record,
    };
    record.differenced = differenced;
}

/// Builds a distribution directly from explicit parameters, bypassing
/// estimation.
///
/// Used by configs and grid entries that pin a family's parameters.
/// Plausibility bounds still apply and violations carry the same error
/// tags as fitted violations.
pub fn from_params(
    kind: ModelKind,
    params: &BTreeMap<String, f64>,
    seed: u64,
) -> Result<ReturnDistribution> {
    let get = |name: &str| -> Result<f64> {
        params.get(name).copied().ok_or_else(|| {
            EngineError::Config(format!(
                "distribution_params.{name}: missing for {}",
                kind.as_str()
            ))
        })
    };
    match kind {
        ModelKind::Laplace => Ok(ReturnDistribution::Laplace(laplace::Laplace::from_params(
            get("loc")?,
            get("scale")?,
            seed,
        )?)),
        ModelKind::Normal => Ok(ReturnDistribution::Normal(
            normal::NormalReturns::from_params(get("mean")?, get("std")?, seed)?,
        )),
        ModelKind::StudentT => Ok(ReturnDistribution::StudentT(
            student_t::StudentTReturns::from_params(get("loc")?, get("scale")?, get("df")?, seed)?,
        )),
        ModelKind::GarchT => Ok(ReturnDistribution::GarchT(garch::GarchT::from_params(
            get("omega")?,
            get("alpha")?,
            get("beta")?,
            get("df")?,
            get("mean")?,
            seed,
        )?)),
    }
}

/// Orders fit records best-first by AIC, breaking ties with BIC.
pub fn rank_by_aic(records: &[FitRecord]) -> Vec<ModelKind> {
    let mut order: Vec<&FitRecord> = records.iter().collect();
    order.sort_by(|a, b| {
        a.aic
            .total_cmp(&b.aic)
            .then_with(|| a.bic.total_cmp(&b.bic))
    });
    order.into_iter().map(|r| r.model).collect()
}

pub(crate) fn validate_input(returns: &[f64], kind: ModelKind) -> Result<()> {
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(EngineError::Data(
            "returns: non-finite value present; clean the series before fitting".to_string(),
        ));
    }
    let min = kind.min_samples();
    if returns.len() < min {
        return Err(EngineError::Fit(
            FitFailure::InsufficientData,
            format!(
                "returns: {} samples; {} requires at least {min}",
                returns.len(),
                kind.as_str()
            ),
        ));
    }
    Ok(())
}

/// Tail grade from fitted excess kurtosis.
pub(crate) fn grade_tails(excess_kurtosis: f64) -> FitStatus {
    if excess_kurtosis >= KURTOSIS_SUCCESS {
        FitStatus::Success
    } else if excess_kurtosis >= KURTOSIS_WARN {
        FitStatus::Warn
    } else {
        FitStatus::Fail
    }
}

/// Cap used when a fitted family has unbounded fourth moments.
pub(crate) const KURTOSIS_CAP: f64 = 1.0e9;

pub(crate) fn sample_mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (MLE denominator).
pub(crate) fn sample_std(values: &[f64]) -> f64 {
    let mean = sample_mean(values);
    let var = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / values.len() as f64;
    var.max(f64::MIN_POSITIVE).sqrt()
}

pub(crate) fn aic(k: f64, log_likelihood: f64) -> f64 {
    2.0 * k - 2.0 * log_likelihood
}

pub(crate) fn bic(k: f64, n: usize, log_likelihood: f64) -> f64 {
    k * (n as f64).ln() - 2.0 * log_likelihood
}
