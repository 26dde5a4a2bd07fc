//! Engine-wide error taxonomy.
//!
//! Every failure surfaced by the engine belongs to one of a closed set of
//! kinds, each with a stable machine-readable tag usable in structured logs
//! and persisted run records. Messages follow the house rule: name the
//! offending field, the value, the constraint violated, and a remediation.

use crate::repro::drift::DriftClass;

/// Sub-kinds of distribution-fit failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitFailure {
    /// Fewer samples than the model's minimum window.
    InsufficientData,
    /// Optimizer exhausted its iteration budget without meeting tolerance.
    NonConvergence,
    /// Unit-root or autocorrelation structure incompatible with IID fitting.
    NonStationary,
    /// Fitted or configured parameters outside plausibility bounds.
    ImplausibleParams,
}

impl FitFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "InsufficientData",
            Self::NonConvergence => "NonConvergence",
            Self::NonStationary => "NonStationary",
            Self::ImplausibleParams => "ImplausibleParams",
        }
    }
}

/// Sub-kinds of numerical failures raised during simulation or pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericFailure {
    /// More than half of the simulated paths crossed zero.
    Bankruptcy,
    /// Non-finite intermediate value in a kernel.
    Overflow,
    /// Implied volatility outside (0, 5].
    InvalidIv,
}

impl NumericFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bankruptcy => "Bankruptcy",
            Self::Overflow => "Overflow",
            Self::InvalidIv => "InvalidIV",
        }
    }
}

/// Closed error taxonomy for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Missing, invalid, or contradictory configuration.
    Config(String),
    /// Schema mismatch, gap beyond tolerance, or timestamp anomaly.
    Data(String),
    /// Distribution-fit failure; fatal to the fit, recoverable via fallback.
    Fit(FitFailure, String),
    /// Memory or CPU ceiling would be crossed; raised before allocation.
    ResourceLimit(String),
    /// Numerical failure inside a kernel.
    Numeric(NumericFailure, String),
    /// Dataset drift detected during replay.
    Drift(DriftClass, String),
    /// A strategy's required feature is absent.
    MissingFeature(String),
    /// Artifact or data I/O failure.
    Io(String),
}

impl EngineError {
    /// Stable machine-readable tag, e.g. `FitError:NonConvergence`.
    pub fn tag(&self) -> String {
        match self {
            Self::Config(_) => "ConfigError".to_string(),
            Self::Data(_) => "DataError".to_string(),
            Self::Fit(kind, _) => format!("FitError:{}", kind.as_str()),
            Self::ResourceLimit(_) => "ResourceLimitError".to_string(),
            Self::Numeric(kind, _) => format!("NumericError:{}", kind.as_str()),
            Self::Drift(class, _) => format!("DriftError:{}", class.as_str()),
            Self::MissingFeature(_) => "MissingFeatureError".to_string(),
            Self::Io(_) => "IoError".to_string(),
        }
    }

    /// Process exit code mandated for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::MissingFeature(_) => 2,
            Self::Data(_) | Self::Drift(_, _) => 3,
            Self::ResourceLimit(_) => 4,
            Self::Fit(_, _) | Self::Numeric(_, _) => 5,
            Self::Io(_) => 1,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Data(msg) => write!(f, "data error: {msg}"),
            Self::Fit(kind, msg) => write!(f, "fit error ({}): {msg}", kind.as_str()),
            Self::ResourceLimit(msg) => write!(f, "resource limit: {msg}"),
            Self::Numeric(kind, msg) => write!(f, "numeric error ({}): {msg}", kind.as_str()),
            Self::Drift(class, msg) => write!(f, "drift ({}): {msg}", class.as_str()),
            Self::MissingFeature(msg) => write!(f, "missing feature: {msg}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}
