//! Student-t return model.
//!
//! Estimation follows a bounded one-dimensional likelihood search over the
//! degrees of freedom: location is pinned to the sample mean and scale is
//! mapped from the sample standard deviation via the variance identity
//! `Var = scale^2 * nu / (nu - 2)`, leaving `nu` as the free parameter.

use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, StudentT};
use statrs::function::gamma::ln_gamma;
use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::{
    aic, bic, grade_tails, sample_mean, sample_std, FitOptions, FitRecord, ModelKind, KURTOSIS_CAP,
};
use crate::core::tuning::{STUDENT_T_DF_MAX, STUDENT_T_DF_MIN};
use crate::core::{EngineError, FitFailure, Result};
use crate::repro::seeds::path_seed;

const DF_SEARCH_FLOOR: f64 = 2.05;
const SCALE_BOUNDS: (f64, f64) = (1.0e-9, 10.0);

/// A fitted Student-t return distribution.
#[derive(Debug, Clone)]
pub struct StudentTReturns {
    pub loc: f64,
    pub scale: f64,
    pub df: f64,
    pub record: FitRecord,
}

/// Bounded maximum-likelihood fit over `nu in [2.05, 100]`.
pub fn fit(returns: &[f64], seed: u64, opts: &FitOptions) -> Result<StudentTReturns> {
    let n = returns.len();
    let loc = sample_mean(returns);
    let std = sample_std(returns);
    if !(SCALE_BOUNDS.0..=SCALE_BOUNDS.1).contains(&std) {
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            format!(
                "std: {std:.3e} outside [{:.0e}, {}]; the input is degenerate or mis-scaled",
                SCALE_BOUNDS.0, SCALE_BOUNDS.1
            ),
        ));
    }

    let steps = opts.max_iterations.clamp(50, 500);
    let span = STUDENT_T_DF_MAX - DF_SEARCH_FLOOR;
    let resolution = span / (steps - 1) as f64;

    let mut best_df = f64::NAN;
    let mut best_scale = f64::NAN;
    let mut best_ll = f64::NEG_INFINITY;
    for step in 0..steps {
        let df = DF_SEARCH_FLOOR + step as f64 * resolution;
        let scale = (std * ((df - 2.0) / df).sqrt()).max(SCALE_BOUNDS.0);
        let ll = log_likelihood(returns, loc, scale, df);
        if ll > best_ll {
            best_ll = ll;
            best_df = df;
            best_scale = scale;
        }
    }

    if !best_ll.is_finite() {
        return Err(EngineError::Fit(
            FitFailure::NonConvergence,
            format!(
                "log_likelihood: non-finite across {steps} candidate df values; \
                 the series is unsuited to a Student-t fit"
            ),
        ));
    }
    if best_df < STUDENT_T_DF_MIN {
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            format!(
                "df: {best_df:.2} below the {STUDENT_T_DF_MIN} plausibility floor; \
                 the tails are heavier than the model can represent"
            ),
        ));
    }

    let excess = fitted_excess_kurtosis(best_df);
    let mut params = BTreeMap::new();
    params.insert("loc".to_string(), loc);
    params.insert("scale".to_string(), best_scale);
    params.insert("df".to_string(), best_df);

    let record = FitRecord {
        model: ModelKind::StudentT,
        params,
        fit_window: n,
        seed,
        log_likelihood: best_ll,
        aic: aic(3.0, best_ll),
        bic: bic(3.0, n, best_ll),
        status: grade_tails(excess),
        excess_kurtosis: excess.min(KURTOSIS_CAP),
        iterations: steps,
        tolerance: resolution,
        differenced: false,
        fallback_from: None,
    };

    Ok(StudentTReturns {
        loc,
        scale: best_scale,
        df: best_df,
        record,
    })
}

/// Excess kurtosis of the fitted family: `6 / (nu - 4)` for `nu > 4`,
/// unbounded otherwise.
pub fn fitted_excess_kurtosis(df: f64) -> f64 {
    if df > 4.0 {
        6.0 / (df - 4.0)
    } else {
        f64::INFINITY
    }
}

fn log_likelihood(values: &[f64], loc: f64, scale: f64, df: f64) -> f64 {
    let a = ln_gamma((df + 1.0) * 0.5) - ln_gamma(df * 0.5);
    let b = -0.5 * (df * PI).ln() - scale.ln();
    values
        .iter()
        .map(|&x| {
            let z = (x - loc) / scale;
            a + b - 0.5 * (df + 1.0) * (1.0 + z * z / df).ln()
        })
        .sum()
}

impl StudentTReturns {
    /// Builds a sampler from explicit parameters, bypassing estimation.
    pub fn from_params(loc: f64, scale: f64, df: f64, seed: u64) -> Result<Self> {
        if !(SCALE_BOUNDS.0..=SCALE_BOUNDS.1).contains(&scale) {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!(
                    "scale: {scale}; must lie in [{:.0e}, {}]",
                    SCALE_BOUNDS.0, SCALE_BOUNDS.1
                ),
            ));
        }
        if !(STUDENT_T_DF_MIN..=STUDENT_T_DF_MAX).contains(&df) {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!("df: {df}; must lie in [{STUDENT_T_DF_MIN}, {STUDENT_T_DF_MAX}]"),
            ));
        }
        let excess = fitted_excess_kurtosis(df);
        let mut params = BTreeMap::new();
        params.insert("loc".to_string(), loc);
        params.insert("scale".to_string(), scale);
        params.insert("df".to_string(), df);
        let record = FitRecord {
            model: ModelKind::StudentT,
            params,
            fit_window: 0,
            seed,
            log_likelihood: 0.0,
            aic: 0.0,
            bic: 0.0,
            status: grade_tails(excess),
            excess_kurtosis: excess.min(KURTOSIS_CAP),
            iterations: 0,
            tolerance: 0.0,
            differenced: false,
            fallback_from: None,
        };
        Ok(Self {
            loc,
            scale,
            df,
            record,
        })
    }

    pub fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        let mut rng = ChaCha12Rng::seed_from_u64(path_seed(base_seed, row));
        let dist = StudentT::new(self.df).expect("df validated at fit");
        for slot in out.iter_mut() {
            let t: f64 = dist.sample(&mut rng);
            *slot = self.loc + self.scale * t;
        }
    }
}
