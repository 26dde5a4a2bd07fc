//! Normal return model.
//!
//! Included as a thin-tailed baseline for model ranking and conditional
//! refits. A Normal fit has zero excess kurtosis and therefore always grades
//! `fail` under tail enforcement.

use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::{aic, bic, grade_tails, sample_mean, sample_std, FitOptions, FitRecord, ModelKind};
use crate::core::{EngineError, FitFailure, Result};
use crate::repro::seeds::path_seed;

const STD_BOUNDS: (f64, f64) = (1.0e-9, 10.0);

/// A fitted Normal return distribution.
#[derive(Debug, Clone)]
pub struct NormalReturns {
    pub mean: f64,
    pub std: f64,
    pub record: FitRecord,
}

/// Closed-form MLE fit.
pub fn fit(returns: &[f64], seed: u64, _opts: &FitOptions) -> Result<NormalReturns> {
    let n = returns.len();
    let mean = sample_mean(returns);
    let std = sample_std(returns);
    if !(STD_BOUNDS.0..=STD_BOUNDS.1).contains(&std) {
        return Err(EngineError::Fit(
            FitFailure::ImplausibleParams,
            format!(
                "std: {std:.3e} outside [{:.0e}, {}]; the input is degenerate or mis-scaled",
                STD_BOUNDS.0, STD_BOUNDS.1
            ),
        ));
    }

    let var = std * std;
    let log_likelihood = -0.5 * n as f64 * ((2.0 * PI * var).ln() + 1.0);

    let mut params = BTreeMap::new();
    params.insert("mean".to_string(), mean);
    params.insert("std".to_string(), std);

    let record = FitRecord {
        model: ModelKind::Normal,
        params,
        fit_window: n,
        seed,
        log_likelihood,
        aic: aic(2.0, log_likelihood),
        bic: bic(2.0, n, log_likelihood),
        status: grade_tails(0.0),
        excess_kurtosis: 0.0,
        iterations: 1,
        tolerance: 0.0,
        differenced: false,
        fallback_from: None,
    };

    Ok(NormalReturns { mean, std, record })
}

impl NormalReturns {
    /// Builds a sampler from explicit parameters, bypassing estimation.
    pub fn from_params(mean: f64, std: f64, seed: u64) -> Result<Self> {
        if !(STD_BOUNDS.0..=STD_BOUNDS.1).contains(&std) {
            return Err(EngineError::Fit(
                FitFailure::ImplausibleParams,
                format!(
                    "std: {std}; must lie in [{:.0e}, {}]",
                    STD_BOUNDS.0, STD_BOUNDS.1
                ),
            ));
        }
        let mut params = BTreeMap::new();
        params.insert("mean".to_string(), mean);
        params.insert("std".to_string(), std);
        let record = FitRecord {
            model: ModelKind::Normal,
            params,
            fit_window: 0,
            seed,
            log_likelihood: 0.0,
            aic: 0.0,
            bic: 0.0,
            status: grade_tails(0.0),
            excess_kurtosis: 0.0,
            iterations: 0,
            tolerance: 0.0,
            differenced: false,
            fallback_from: None,
        };
        Ok(Self { mean, std, record })
    }

    pub fn fill_row(&self, base_seed: u64, row: usize, out: &mut [f64]) {
        let mut rng = ChaCha12Rng::seed_from_u64(path_seed(base_seed, row));
        let dist = Normal::new(self.mean, self.std).expect("validated at fit");
        for slot in out.iter_mut() {
            *slot = dist.sample(&mut rng);
        }
    }
}
