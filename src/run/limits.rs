//! Wall-clock budgets and cooperative cancellation.
//!
//! Budgets are checked at stage boundaries, never inside kernels, with
//! tiered observability: INFO at 1.5x the budget, WARN at 2x, fatal at 3x.
//! Cancellation is a single process-wide flag, single-writer many-reader;
//! workers poll it between kernels and drain gracefully.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::core::tuning::{
    BUDGET_FATAL_MULTIPLIER, BUDGET_INFO_MULTIPLIER, BUDGET_WARN_MULTIPLIER, GRID_WORKER_CAP,
};
use crate::core::{EngineError, Result};

static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Requests a graceful shutdown; in-flight kernels finish first.
pub fn request_cancellation() {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Checked by workers between kernels.
pub fn cancellation_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Clears the flag; intended for process startup and tests.
pub fn reset_cancellation() {
    CANCELLED.store(false, Ordering::SeqCst);
}

/// Stage-boundary budget tracker for one command.
#[derive(Debug, Clone)]
pub struct StageClock {
    started: Instant,
    budget: Duration,
}

impl StageClock {
    pub fn new(budget_secs: f64) -> Self {
        Self {
            started: Instant::now(),
            budget: Duration::from_secs_f64(budget_secs),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Applies the tiered budget policy at a stage boundary.
    pub fn checkpoint(&self, stage: &str) -> Result<()> {
        let ratio = self.elapsed().as_secs_f64() / self.budget.as_secs_f64().max(1.0e-9);
        if ratio >= BUDGET_FATAL_MULTIPLIER {
            return Err(EngineError::ResourceLimit(format!(
                "wall_clock: {:.1}s at stage '{stage}' is {ratio:.1}x the {:.0}s budget; \
                 reduce the workload or raise the budget",
                self.elapsed().as_secs_f64(),
                self.budget.as_secs_f64()
            )));
        }
        if ratio >= BUDGET_WARN_MULTIPLIER {
            tracing::warn!(stage, ratio, "run is over twice its wall-clock budget");
        } else if ratio >= BUDGET_INFO_MULTIPLIER {
            tracing::info!(stage, ratio, "run is past its wall-clock budget");
        }
        Ok(())
    }
}

/// Grid worker count: `min(configured, detected_cpu - 2, 6)`, floored at 1.
pub fn worker_count(configured: Option<usize>) -> usize {
    let detected = num_cpus::get().saturating_sub(2).max(1);
    configured
        .unwrap_or(GRID_WORKER_CAP)
        .min(detected)
        .min(GRID_WORKER_CAP)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clock_passes_checkpoints() {
        let clock = StageClock::new(10.0);
        assert!(clock.checkpoint("fit").is_ok());
    }

    #[test]
    fn blown_budget_is_fatal() {
        let clock = StageClock {
            started: Instant::now() - Duration::from_secs(31),
            budget: Duration::from_secs(10),
        };
        let err = clock.checkpoint("paths").unwrap_err();
        assert_eq!(err.tag(), "ResourceLimitError");
    }

    #[test]
    fn worker_count_honors_all_caps() {
        assert!(worker_count(None) >= 1);
        assert!(worker_count(Some(100)) <= GRID_WORKER_CAP);
        assert_eq!(worker_count(Some(1)), 1);
    }

    #[test]
    fn cancellation_flag_round_trips() {
        reset_cancellation();
        assert!(!cancellation_requested());
        request_cancellation();
        assert!(cancellation_requested());
        reset_cancellation();
    }
}
