//! GARCH(1,1) with Student-t innovations.
//!
//! Estimation uses variance targeting: the long-run variance is pinned to
//! the sample variance, which fixes `omega = var * (1 - alpha - beta)` and
//! reduces the search to a bounded grid over `(alpha, beta, nu)`. The grid
//! count and resolution are recorded on the fit. Sampling runs the variance
//! recursion per path with a stream derived from the caller seed, so paths
//! are reproducible independently of chunking.

use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, StudentT};
use statrs::function::gamma::ln_gamma;
use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::{aic, bic, grade_tails, sample_mean, FitOptions, FitRecord, ModelKind, KURTOSIS_CAP};
use crate::core::tuning::GARCH_PERSISTENCE_MAX;
use crate::core::{EngineError, FitFailure, Result};
use crate::repro::seeds::path_seed;

const ALPHA_GRID: (f64, f64, usize) = (0.02, 0.30, 15);
const BETA_GRID: (f64, f64, usize) = (0.50, 0.97, 48);
const DF_GRID: [f64; 8] = [4.5, 5.0, 6.0, 8.0, 10.0, 12.0, 16.0, 30.0];

/// Persistence below this indicates a degenerate recursion rather than a fit.
const PERSISTENCE_FLOOR: f64 = 0.05;

/// A fitted GARCH(1,1)-t return distribution.
#[derive(Debug, Clone)]
pub struct GarchT {
    pub omega: f64,
    pub alpha: f64,
    pub beta: f64,
    pub df: f64,
    pub mean: f64,
    /// Long-run (unconditional) variance used to start each simulated path.
    pub unconditional_var: f64,
    pub record: FitRecord,
}

/// Bounded grid MLE with variance targeting.
pub fn fit(returns: &[f64], seed: u64, opts: &FitOptions) -> Result<GarchT> {
    let n = returns.len();
    let mean = sample_mean(returns);
    let residuals: Vec<f64> = returns.iter().map(|r| r - mean).collect();
    let var = residuals.iter().map(|e| e * e).sum::<f64>() / n as f64;
    if var <= 1.0e-18 {
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            "variance: ~0; a constant series cannot drive a volatility recursion".to_string(),
        ));
    }

    let mut best: Option<(f64, f64, f64, f64)> = None; // (alpha, beta, df, ll)
    let mut evaluations = 0usize;
    'outer: for ai in 0..ALPHA_GRID.2 {
        let alpha = ALPHA_GRID.0 + ai as f64 * (ALPHA_GRID.1 - ALPHA_GRID.0) / (ALPHA_GRID.2 - 1) as f64;
        for bi in 0..BETA_GRID.2 {
            let beta = BETA_GRID.0 + bi as f64 * (BETA_GRID.1 - BETA_GRID.0) / (BETA_GRID.2 - 1) as f64;
            if alpha + beta >= GARCH_PERSISTENCE_MAX {
                continue;
            }
            for &df in DF_GRID.iter() {
                if evaluations >= opts.max_iterations {
                    break 'outer;
                }
                evaluations += 1;
                let omega = var * (1.0 - alpha - beta);
                let ll = log_likelihood(&residuals, var, omega, alpha, beta, df);
                if best.map_or(true, |(_, _, _, b)| ll > b) && ll.is_finite() {
                    best = Some((alpha, beta, df, ll));
                }
            }
        }
    }

    let (alpha, beta, df, log_likelihood) = best.ok_or_else(|| {
        EngineError::Fit(
            FitFailure::NonConvergence,
            format!(
                "log_likelihood: non-finite across {evaluations} grid points; \
                 widen the window or choose an IID family"
            ),
        )
    })?;

    let persistence = alpha + beta;
    if persistence >= GARCH_PERSISTENCE_MAX {
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            format!(
                "alpha+beta: {persistence:.4} at or above {GARCH_PERSISTENCE_MAX}; \
                 the variance process is explosive"
            ),
        ));
    }
    if persistence < PERSISTENCE_FLOOR {
        return Err(EngineError::Fit(
            FitFailure::NonConvergence,
            format!(
                "alpha+beta: {persistence:.4} below {PERSISTENCE_FLOOR}; no volatility \
                 clustering detected, an IID family fits this series better"
            ),
        ));
    }

    let omega = var * (1.0 - persistence);
    let excess = fitted_excess_kurtosis(alpha, beta, df);

    let mut params = BTreeMap::new();
    params.insert("omega".to_string(), omega);
    params.insert("alpha".to_string(), alpha);
    params.insert("beta".to_string(), beta);
    params.insert("df".to_string(), df);
    params.insert("mean".to_string(), mean);

    let record = FitRecord {
        model: ModelKind::GarchT,
        params,
        fit_window: n,
        seed,
        log_likelihood,
        aic: aic(4.0, log_likelihood),
        bic: bic(4.0, n, log_likelihood),
        status: grade_tails(excess),
        excess_kurtosis: excess.min(KURTOSIS_CAP),
        iterations: evaluations,
        tolerance: (BETA_GRID.1 - BETA_GRID.0) / (BETA_GRID.2 - 1) as f64,
        differenced: false,
        fallback_from: None,
    };

    Ok(GarchT {
        omega,
        alpha,
        beta,
        df,
        mean,
        unconditional_var: var,
        record,
    })
}

/// Unconditional excess kurtosis of GARCH(1,1) with standardized-t shocks.
///
/// With innovation kurtosis `K_z = 3(nu-2)/(nu-4)`, the process kurtosis is
/// `K_z (1 - p^2) / (1 - p^2 - alpha^2 (K_z - 1))` where `p = alpha + beta`,
/// provided the denominator is positive; otherwise the fourth moment does
/// not exist.
pub fn fitted_excess_kurtosis(alpha: f64, beta: f64, df: f64) -> f64 {
    if df <= 4.0 {
        return f64::INFINITY;
    }
    let k_z = 3.0 * (df - 2.0) / (df - 4.0);
    let p2 = (alpha + beta) * (alpha + beta);
    let denom = 1.0 - p2 - alpha * alpha * (k_z - 1.0);
    if denom <= 0.0 {
        return f64::INFINITY;
    }
    k_z * (1.0 - p2) / denom - 3.0
}

fn log_likelihood(
    residuals: &[f64],
    initial_var: f64,
    omega: f64,
    alpha: f64,
    beta: f64,
    df: f64,
) -> f64 {
    // Standardized-t log-density with conditional variance h, so that the
    // innovation e = z * sqrt(h) has unit-variance shocks z.
    let ln_c = ln_gamma((df + 1.0) * 0.5) - ln_gamma(df * 0.5) - 0.5 * ((df - 2.0) * PI).ln();
    let mut h = initial_var;
    let mut ll = 0.0;
    for &e in residuals {
        if h <= 0.0 || !h.is_finite() {
            return f64::NEG_INFINITY;
        }
        let z2 = e * e / h;
        ll += ln_c - 0.5 * h.ln() - 0.5 * (df + 1.0) * (1.0 + z2 / (df - 2.0)).ln();
        h = omega + alpha * e * e + beta * h;
    }
    ll
}

impl GarchT {
    /// Builds a sampler from explicit parameters, bypassing estimation.
    pub fn from_params(
        omega: f64,
        alpha: f64,
        beta: f64,
        df: f64,
        mean: f64,
        seed: u64,
    ) -> Result<Self> {
        if omega <= 0.0 || alpha < 0.0 || beta < 0.0 {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!("omega/alpha/beta: {omega}/{alpha}/{beta}; signs are invalid"),
            ));
        }
        let persistence = alpha + beta;
        if persistence >= GARCH_PERSISTENCE_MAX {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!(
                    "alpha+beta: {persistence:.4} at or above {GARCH_PERSISTENCE_MAX}; \
                     the variance process is explosive"
                ),
            ));
        }
        if df <= 2.0 || df > 100.0 {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!("df: {df}; must lie in (2, 100]"),
            ));
        }

        let excess = fitted_excess_kurtosis(alpha, beta, df);
        let mut params = BTreeMap::new();
        params.insert("omega".to_string(), omega);
        params.insert("alpha".to_string(), alpha);
        params.insert("beta".to_string(), beta);
        params.insert("df".to_string(), df);
        params.insert("mean".to_string(), mean);
        let record = FitRecord {
            model: ModelKind::GarchT,
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
            omega,
            alpha,
            beta,
            df,
            mean,
            unconditional_var: omega / (1.0 - persistence),
            record,
        })
    }

    /// Runs the variance recursion for one path from its derived stream.
    pub fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        let mut rng = ChaCha12Rng::seed_from_u64(path_seed(base_seed, row));
        let shock = StudentT::new(self.df).expect("df validated at fit");
        // Scale raw t draws to unit variance so h is the conditional variance.
        let unit = ((self.df - 2.0) / self.df).sqrt();

        let mut h = self.unconditional_var;
        for slot in out.iter_mut() {
            let t: f64 = shock.sample(&mut rng);
            let e = t * unit * h.sqrt();
            *slot = self.mean + e;
            h = self.omega + self.alpha * e * e + self.beta * h;
        }
    }
}
