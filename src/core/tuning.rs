//! Numerical thresholds and cost defaults, gathered in one place so a run's
//! metadata can capture them verbatim.

use serde::{Deserialize, Serialize};

/// Trading days per year used for annualization and day-count conversions.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Minimum sample window for the IID models (Laplace, Normal, Student-t).
pub const MIN_SAMPLES_IID: usize = 60;
/// Minimum sample window for GARCH-t.
pub const MIN_SAMPLES_GARCH: usize = 252;

/// Fitted excess kurtosis at or above this grades the fit `success`.
pub const KURTOSIS_SUCCESS: f64 = 1.0;
/// Fitted excess kurtosis at or above this (but below success) grades `warn`.
pub const KURTOSIS_WARN: f64 = 0.5;

/// Student-t degrees of freedom below this are implausible for equity returns.
pub const STUDENT_T_DF_MIN: f64 = 2.5;
/// Upper bound of the degrees-of-freedom search range.
pub const STUDENT_T_DF_MAX: f64 = 100.0;
/// GARCH persistence alpha + beta at or above this is implausible.
pub const GARCH_PERSISTENCE_MAX: f64 = 0.999;

/// ADF test statistic threshold (5% critical value, constant-only regression).
pub const ADF_CRITICAL_5PCT: f64 = -2.86;
/// Lag-1 autocorrelation above this rejects IID fitting.
pub const AR_LAG1_MAX: f64 = 0.25;

/// Price cap beyond which a path is treated as overflowed.
pub const PRICE_OVERFLOW_CAP: f64 = 1.0e18;
/// A path that falls below this fraction of its starting price has
/// underflowed economically and is marked bankrupt.
pub const PRICE_UNDERFLOW_FRACTION: f64 = 1.0e-9;
/// Bankruptcy rate above this marks the run `warn`.
pub const BANKRUPTCY_WARN_RATE: f64 = 0.05;
/// Bankruptcy rate above this fails the run.
pub const BANKRUPTCY_FAIL_RATE: f64 = 0.50;

/// Multiplier applied to the raw matrix size when estimating the footprint.
pub const FOOTPRINT_SAFETY_FACTOR: f64 = 1.1;
/// Footprint below this fraction of available RAM stays in memory.
pub const MEM_FRACTION_INLINE: f64 = 0.25;
/// Footprint below this fraction of available RAM spills to a backing file.
pub const MEM_FRACTION_SPILL: f64 = 0.50;
/// Assumed available RAM when no ceiling is configured and none is detectable.
pub const DEFAULT_AVAILABLE_RAM_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Episode distance threshold in z-space for conditional matching.
pub const CONDITIONAL_DISTANCE_Z: f64 = 2.0;
/// Minimum matched episodes before bootstrap falls back to unconditional.
pub const CONDITIONAL_MIN_MATCH: usize = 10;
/// Minimum episodes a selector should yield before warning of sparsity.
pub const SELECTOR_MIN_EPISODES: usize = 30;

/// Per-trade slippage in basis points of notional.
pub const DEFAULT_SLIPPAGE_BPS: f64 = 5.0;
/// Commission per share traded.
pub const DEFAULT_FEE_PER_SHARE: f64 = 0.005;
/// Commission per option contract traded.
pub const DEFAULT_FEE_PER_CONTRACT: f64 = 0.65;
/// Shares per option contract.
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

/// Tail probability for VaR and CVaR.
pub const VAR_ALPHA: f64 = 0.05;
/// Guard against zero dispersion when z-scoring grid metrics.
pub const OBJECTIVE_EPSILON: f64 = 1.0e-8;

/// Composite objective weights: pnl, sharpe, drawdown, cvar.
pub const OBJECTIVE_WEIGHTS: ObjectiveWeights = ObjectiveWeights {
    pnl: 0.30,
    sharpe: 0.30,
    drawdown: 0.20,
    cvar: 0.20,
};

/// Wall-clock budget multipliers for tiered observability.
pub const BUDGET_INFO_MULTIPLIER: f64 = 1.5;
pub const BUDGET_WARN_MULTIPLIER: f64 = 2.0;
pub const BUDGET_FATAL_MULTIPLIER: f64 = 3.0;

/// Baseline wall-clock budgets per command, in seconds.
pub const BUDGET_COMPARE_SECS: f64 = 10.0;
pub const BUDGET_GRID_SECS: f64 = 900.0;
pub const BUDGET_SCREEN_PER_SYMBOL_SECS: f64 = 1.0;

/// Hard cap on grid workers regardless of detected CPUs.
pub const GRID_WORKER_CAP: usize = 6;

/// Row-count drift beyond this fraction is fatal to replay.
pub const COUNT_DRIFT_FATAL: f64 = 0.10;
/// Return mean/std drift beyond this fraction is fatal to replay.
pub const DISTRIBUTION_DRIFT_FATAL: f64 = 0.20;

/// Gap wider than this multiple of the bar interval is flagged.
pub const GAP_TOLERANCE_INTERVALS: i64 = 3;

/// Composite objective weight set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub pnl: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub cvar: f64,
}

/// Snapshot of every tunable above, embedded verbatim in run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningSnapshot {
    pub min_samples_iid: usize,
    pub min_samples_garch: usize,
    pub kurtosis_success: f64,
    pub kurtosis_warn: f64,
    pub student_t_df_min: f64,
    pub garch_persistence_max: f64,
    pub price_overflow_cap: f64,
    pub price_underflow_fraction: f64,
    pub bankruptcy_warn_rate: f64,
    pub bankruptcy_fail_rate: f64,
    pub mem_fraction_inline: f64,
    pub mem_fraction_spill: f64,
    pub conditional_distance_z: f64,
    pub conditional_min_match: usize,
    pub selector_min_episodes: usize,
    pub slippage_bps: f64,
    pub fee_per_share: f64,
    pub fee_per_contract: f64,
    pub var_alpha: f64,
    pub objective_weights: ObjectiveWeights,
    pub budget_multipliers: [f64; 3],
    pub count_drift_fatal: f64,
    pub distribution_drift_fatal: f64,
}

impl TuningSnapshot {
    pub fn current() -> Self {
        Self {
            min_samples_iid: MIN_SAMPLES_IID,
            min_samples_garch: MIN_SAMPLES_GARCH,
            kurtosis_success: KURTOSIS_SUCCESS,
            kurtosis_warn: KURTOSIS_WARN,
            student_t_df_min: STUDENT_T_DF_MIN,
            garch_persistence_max: GARCH_PERSISTENCE_MAX,
            price_overflow_cap: PRICE_OVERFLOW_CAP,
            price_underflow_fraction: PRICE_UNDERFLOW_FRACTION,
            bankruptcy_warn_rate: BANKRUPTCY_WARN_RATE,
            bankruptcy_fail_rate: BANKRUPTCY_FAIL_RATE,
            mem_fraction_inline: MEM_FRACTION_INLINE,
            mem_fraction_spill: MEM_FRACTION_SPILL,
            conditional_distance_z: CONDITIONAL_DISTANCE_Z,
            conditional_min_match: CONDITIONAL_MIN_MATCH,
            selector_min_episodes: SELECTOR_MIN_EPISODES,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            fee_per_share: DEFAULT_FEE_PER_SHARE,
            fee_per_contract: DEFAULT_FEE_PER_CONTRACT,
            var_alpha: VAR_ALPHA,
            objective_weights: OBJECTIVE_WEIGHTS,
            budget_multipliers: [
                BUDGET_INFO_MULTIPLIER,
                BUDGET_WARN_MULTIPLIER,
                BUDGET_FATAL_MULTIPLIER,
            ],
            count_drift_fatal: COUNT_DRIFT_FATAL,
            distribution_drift_fatal: DISTRIBUTION_DRIFT_FATAL,
        }
    }
}
