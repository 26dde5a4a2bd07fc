//! Unit-root and serial-correlation screens applied before IID fitting.

use crate::core::tuning::{ADF_CRITICAL_5PCT, AR_LAG1_MAX};

/// Outcome of the pre-fit stationarity screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationarityCheck {
    /// Dickey-Fuller t-statistic of the lagged-level coefficient.
    pub adf_statistic: f64,
    /// Lag-1 sample autocorrelation.
    pub lag1_autocorrelation: f64,
    /// True when the unit-root hypothesis is rejected at 5%.
    pub stationary: bool,
    /// True when lag-1 autocorrelation exceeds the IID tolerance.
    pub ar_structure: bool,
}

/// Runs the augmented Dickey-Fuller regression (constant, no lags) and the
/// lag-1 autocorrelation screen.
///
/// The regression is `dy_t = c + gamma * y_{t-1} + e_t`; the returned
/// statistic is the t-ratio of `gamma`. Values below the 5% critical value
/// reject the unit root.
pub fn check_stationarity(series: &[f64]) -> StationarityCheck {
    let adf_statistic = adf_statistic(series);
    let lag1 = lag1_autocorrelation(series);
    StationarityCheck {
        adf_statistic,
        lag1_autocorrelation: lag1,
        stationary: adf_statistic < ADF_CRITICAL_5PCT,
        ar_structure: lag1.abs() > AR_LAG1_MAX,
    }
}

/// First differences of a series.
pub fn difference(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

fn adf_statistic(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 10 {
        // Too short to test; treat as non-stationary so short inputs are
        // caught by the sample-size gate instead.
        return 0.0;
    }

    // OLS of dy on [1, y_lag].
    let m = n - 1;
    let mut sum_y = 0.0;
    let mut sum_dy = 0.0;
    for t in 1..n {
        sum_y += series[t - 1];
        sum_dy += series[t] - series[t - 1];
    }
    let mean_y = sum_y / m as f64;
    let mean_dy = sum_dy / m as f64;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for t in 1..n {
        let x = series[t - 1] - mean_y;
        let y = (series[t] - series[t - 1]) - mean_dy;
        sxx += x * x;
        sxy += x * y;
    }
    if sxx <= f64::EPSILON {
        return 0.0;
    }

    let gamma = sxy / sxx;
    let intercept = mean_dy - gamma * mean_y;

    let mut rss = 0.0;
    for t in 1..n {
        let fitted = intercept + gamma * series[t - 1];
        let resid = (series[t] - series[t - 1]) - fitted;
        rss += resid * resid;
    }
    let dof = (m - 2).max(1) as f64;
    let sigma2 = rss / dof;
    let se = (sigma2 / sxx).sqrt();
    if se <= f64::EPSILON {
        return 0.0;
    }
    gamma / se
}

fn lag1_autocorrelation(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 3 {
        return 0.0;
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let mut denom = 0.0;
    for &x in series {
        let d = x - mean;
        denom += d * d;
    }
    if denom <= f64::EPSILON {
        return 0.0;
    }
    let mut num = 0.0;
    for t in 1..n {
        num += (series[t] - mean) * (series[t - 1] - mean);
    }
    num / denom
}
